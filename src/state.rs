use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a connection. The numeric codes are stable and go over the wire in ping packets.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionState {
    BeforeConnect = 1,
    BeingConnect = 2,
    Connected = 3,
    ConnectFailed = 6,

    RunWithoutHandshake = 10,
    RunSimplex = 11,
    RunDuplex = 12,

    BeingCloseByClient = 20,
    Closed = 22,
    UnexpectedClosed = 26,

    BeingCloseByServer = 30,
    ClosedByPeer = 32,
    UnexpectedClosedByPeer = 36,

    ErrorUnknown = 40,
}

impl ConnectionState {
    /// true for the states in which application traffic is accepted
    pub fn is_run(self) -> bool {
        use ConnectionState::*;
        matches!(self, RunWithoutHandshake | RunSimplex | RunDuplex)
    }

    pub fn is_before_connected(self) -> bool {
        use ConnectionState::*;
        matches!(self, BeforeConnect | BeingConnect)
    }

    pub fn is_closing(self) -> bool {
        use ConnectionState::*;
        matches!(self, BeingCloseByClient | BeingCloseByServer)
    }

    /// No transition leads out of a terminal state. Reconnecting means creating a new handler.
    pub fn is_terminal(self) -> bool {
        use ConnectionState::*;
        matches!(self, Closed | ClosedByPeer | UnexpectedClosed | UnexpectedClosedByPeer | ConnectFailed | ErrorUnknown)
    }

    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn can_transition_from(self, before: ConnectionState) -> bool {
        use ConnectionState::*;

        match self {
            BeforeConnect => false,
            BeingConnect => before == BeforeConnect,
            Connected | ConnectFailed => before.is_before_connected(),
            RunWithoutHandshake => before == Connected,
            RunSimplex | RunDuplex => before == RunWithoutHandshake,
            BeingCloseByClient | BeingCloseByServer => before.is_run(),
            Closed => before == BeingCloseByClient || before.is_before_connected(),
            ClosedByPeer => before == BeingCloseByServer,
            UnexpectedClosed | UnexpectedClosedByPeer => before == Connected || before.is_run(),
            ErrorUnknown => !before.is_terminal(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StateChangeResult {
    pub changed: bool,
    pub before: ConnectionState,
    pub current: ConnectionState,
}

/// The authoritative state of a connection. Every change goes through [ConnectionStateCell::transition]
///  which checks and sets atomically, and notifies subscribers of every actual change.
pub struct ConnectionStateCell {
    name: String,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionStateCell {
    pub fn new(name: String) -> ConnectionStateCell {
        let (state, _) = watch::channel(ConnectionState::BeforeConnect);
        ConnectionStateCell {
            name,
            state,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn transition(&self, target: ConnectionState) -> StateChangeResult {
        let mut before = target;
        let changed = self.state.send_if_modified(|state| {
            before = *state;
            if target.can_transition_from(*state) {
                *state = target;
                true
            }
            else {
                false
            }
        });

        if changed {
            debug!(name=%self.name, ?before, current=?target, "connection state changed");
            StateChangeResult { changed, before, current: target }
        }
        else {
            debug!(name=%self.name, ?before, ?target, "connection state transition not allowed - ignoring");
            StateChangeResult { changed, before, current: before }
        }
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use ConnectionState::*;
    use super::*;

    fn cell_in(path: &[ConnectionState]) -> ConnectionStateCell {
        let cell = ConnectionStateCell::new("test".to_string());
        for &s in path {
            assert!(cell.transition(s).changed, "{:?}", s);
        }
        cell
    }

    #[rstest]
    #[case::connect(vec![], BeingConnect, true)]
    #[case::direct_connected(vec![], Connected, true)]
    #[case::connected(vec![BeingConnect], Connected, true)]
    #[case::connect_failed(vec![BeingConnect], ConnectFailed, true)]
    #[case::run_without_handshake(vec![Connected], RunWithoutHandshake, true)]
    #[case::run_before_connect(vec![], RunWithoutHandshake, false)]
    #[case::duplex(vec![Connected, RunWithoutHandshake], RunDuplex, true)]
    #[case::duplex_from_connected(vec![Connected], RunDuplex, false)]
    #[case::simplex_to_duplex(vec![Connected, RunWithoutHandshake, RunSimplex], RunDuplex, false)]
    #[case::client_close(vec![Connected, RunWithoutHandshake, RunSimplex], BeingCloseByClient, true)]
    #[case::closed(vec![Connected, RunWithoutHandshake, BeingCloseByClient], Closed, true)]
    #[case::closed_from_run(vec![Connected, RunWithoutHandshake], Closed, false)]
    #[case::closed_before_connect(vec![], Closed, true)]
    #[case::closed_by_peer(vec![Connected, RunWithoutHandshake, BeingCloseByServer], ClosedByPeer, true)]
    #[case::unexpected(vec![Connected, RunWithoutHandshake, RunDuplex], UnexpectedClosedByPeer, true)]
    #[case::unexpected_while_closing(vec![Connected, RunWithoutHandshake, BeingCloseByClient], UnexpectedClosed, false)]
    #[case::error_unknown(vec![Connected], ErrorUnknown, true)]
    #[case::leave_terminal(vec![BeingConnect, ConnectFailed], Connected, false)]
    #[case::error_from_terminal(vec![BeingConnect, ConnectFailed], ErrorUnknown, false)]
    #[case::back_to_start(vec![BeingConnect], BeforeConnect, false)]
    fn test_transition(#[case] path: Vec<ConnectionState>, #[case] target: ConnectionState, #[case] expected_changed: bool) {
        let cell = cell_in(&path);
        let before = cell.current();

        let result = cell.transition(target);
        assert_eq!(result.changed, expected_changed);
        assert_eq!(result.before, before);
        if expected_changed {
            assert_eq!(result.current, target);
            assert_eq!(cell.current(), target);
        }
        else {
            assert_eq!(result.current, before);
            assert_eq!(cell.current(), before);
        }
    }

    #[rstest]
    #[case(BeforeConnect, false, false)]
    #[case(Connected, false, false)]
    #[case(RunWithoutHandshake, true, false)]
    #[case(RunDuplex, true, false)]
    #[case(BeingCloseByServer, false, false)]
    #[case(ClosedByPeer, false, true)]
    #[case(ConnectFailed, false, true)]
    fn test_classification(#[case] state: ConnectionState, #[case] is_run: bool, #[case] is_terminal: bool) {
        assert_eq!(state.is_run(), is_run);
        assert_eq!(state.is_terminal(), is_terminal);
    }

    #[test]
    fn test_codes() {
        assert_eq!(RunDuplex.code(), 12);
        assert_eq!(ConnectionState::try_from(36u8).unwrap(), UnexpectedClosedByPeer);
        assert!(ConnectionState::try_from(99u8).is_err());
    }

    #[tokio::test]
    async fn test_subscribe() {
        let cell = cell_in(&[]);
        let mut rx = cell.subscribe();

        cell.transition(Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connected);

        // rejected transitions do not notify
        cell.transition(RunDuplex);
        assert!(!rx.has_changed().unwrap());
    }
}
