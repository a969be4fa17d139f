use std::sync::atomic::{AtomicI32, Ordering};

/// Stream ids have a fixed parity per peer role, so both sides can open streams without
///  coordination: the client (agent) uses odd ids, the server (collector) even ids.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerRole {
    Client,
    Server,
}

impl PeerRole {
    fn first_id(self) -> i32 {
        match self {
            PeerRole::Client => 1,
            PeerRole::Server => 2,
        }
    }

    pub fn owns(self, stream_id: i32) -> bool {
        stream_id > 0 && stream_id % 2 == self.first_id() % 2
    }

    pub fn peer(self) -> PeerRole {
        match self {
            PeerRole::Client => PeerRole::Server,
            PeerRole::Server => PeerRole::Client,
        }
    }
}

pub struct StreamIdGenerator {
    role: PeerRole,
    next: AtomicI32,
}

impl StreamIdGenerator {
    pub fn new(role: PeerRole) -> StreamIdGenerator {
        StreamIdGenerator {
            role,
            next: AtomicI32::new(role.first_id()),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Ids increase monotonically, starting over at the first id after exhausting the positive
    ///  range.
    pub fn next_id(&self) -> i32 {
        let first = self.role.first_id();
        let prev = self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
            Some(if cur > i32::MAX - 2 { first } else { cur + 2 })
        });
        // the closure never returns None
        prev.unwrap_or(first)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::client(PeerRole::Client, vec![1, 3, 5, 7])]
    #[case::server(PeerRole::Server, vec![2, 4, 6, 8])]
    fn test_next_id(#[case] role: PeerRole, #[case] expected: Vec<i32>) {
        let generator = StreamIdGenerator::new(role);
        let ids = (0..4).map(|_| generator.next_id()).collect::<Vec<_>>();
        assert_eq!(ids, expected);
        assert!(ids.iter().all(|&id| role.owns(id)));
        assert!(ids.iter().all(|&id| !role.peer().owns(id)));
    }

    #[test]
    fn test_wrap_around() {
        let generator = StreamIdGenerator::new(PeerRole::Client);
        generator.next.store(i32::MAX - 2, Ordering::Relaxed);
        assert_eq!(generator.next_id(), i32::MAX - 2);
        assert_eq!(generator.next_id(), i32::MAX);
        assert_eq!(generator.next_id(), 1);
    }

    #[rstest]
    #[case(PeerRole::Client, 0, false)]
    #[case(PeerRole::Server, 0, false)]
    #[case(PeerRole::Client, -1, false)]
    #[case(PeerRole::Server, -2, false)]
    #[case(PeerRole::Client, 9, true)]
    #[case(PeerRole::Server, 10, true)]
    fn test_owns(#[case] role: PeerRole, #[case] stream_id: i32, #[case] expected: bool) {
        assert_eq!(role.owns(stream_id), expected);
    }
}
