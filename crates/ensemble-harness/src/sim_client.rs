//! A sharing session wired to a simulated transport.

use std::sync::Arc;

use ensemble_core::{Lobby, PumpStats, SessionConfig, SharingSession, SharingTarget};
use ensemble_proto::Identification;

use crate::{sim_env::SimEnv, sim_hub::SimHub, sim_transport::SimTransport};

/// One simulated peer: transport plus session.
pub struct SimClient {
    transport: Arc<SimTransport>,
    session: SharingSession<SimEnv>,
}

impl SimClient {
    /// Connects to `hub`. The session's device id is the player name.
    pub fn new(hub: &Arc<SimHub>, name: &str) -> Self {
        let transport = Arc::new(SimTransport::connect(hub, name));
        let config = SessionConfig { device_id: name.to_string() };
        let session = SharingSession::new(hub.env().clone(), transport.clone(), config);
        Self { transport, session }
    }

    /// Connects and asks to join `room`. The join completes on a later pump.
    pub fn join(hub: &Arc<SimHub>, name: &str, room: &str) -> Self {
        let client = Self::new(hub, name);
        client.transport.join_room(room);
        client
    }

    /// The simulated transport.
    pub fn transport(&self) -> &Arc<SimTransport> {
        &self.transport
    }

    /// The session.
    pub fn session(&self) -> &SharingSession<SimEnv> {
        &self.session
    }

    /// The session, mutably.
    pub fn session_mut(&mut self) -> &mut SharingSession<SimEnv> {
        &mut self.session
    }

    /// Target for `id` in this peer's registry.
    pub fn target(&self, id: &Identification) -> Arc<SharingTarget> {
        self.session.target(id)
    }

    /// Routes everything the transport has received.
    pub fn pump(&mut self) -> PumpStats {
        self.session.pump()
    }
}

/// Pumps every client until a full round routes nothing.
///
/// Returns the number of rounds that routed events. Gives up after
/// `max_rounds`, which only happens if peers keep answering each other.
pub fn settle(clients: &mut [SimClient], max_rounds: usize) -> usize {
    for round in 0..max_rounds {
        let routed: usize = clients.iter_mut().map(|client| client.pump().routed).sum();
        if routed == 0 {
            return round;
        }
    }
    tracing::warn!(max_rounds, "simulation did not settle");
    max_rounds
}

#[cfg(test)]
mod tests {
    use ensemble_core::Transport;
    use ensemble_proto::{TargetType, Value};
    use ensemble_server::RoomConfig;

    use super::*;

    #[test]
    fn peers_settle_on_shared_value() {
        let hub = Arc::new(SimHub::new(SimEnv::with_seed(5), RoomConfig::default()));
        hub.host_room("lobby");
        let mut clients =
            vec![SimClient::join(&hub, "ann", "lobby"), SimClient::join(&hub, "bob", "lobby")];
        settle(&mut clients, 8);

        let id = Identification::new(TargetType::Object, "door");
        let door_a = clients[0].target(&id);
        let door_b = clients[1].target(&id);
        door_a.set_property("open", Some(Value::Bool(true)));

        assert!(settle(&mut clients, 8) < 8);
        assert_eq!(door_b.try_get_property("open"), Some(Value::Bool(true)));
        assert!(clients[1].transport().is_connected());
    }
}
