/// The collector's verdict on a handshake, transmitted as a pair of `code` and `subCode` in the
///  handshake response map.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HandshakeResponseCode {
    Success,
    SimplexCommunication,
    DuplexCommunication,

    AlreadyKnown,
    AlreadySimplexCommunication,
    AlreadyDuplexCommunication,

    PropertyError,
    ProtocolError,
    UnknownError,

    /// any (code, subCode) pair that is not known locally
    UnknownCode,
}

impl HandshakeResponseCode {
    pub fn from_pair(code: i32, sub_code: i32) -> HandshakeResponseCode {
        use HandshakeResponseCode::*;

        match (code, sub_code) {
            (0, 0) => Success,
            (0, 1) => SimplexCommunication,
            (0, 2) => DuplexCommunication,
            (1, 0) => AlreadyKnown,
            (1, 1) => AlreadySimplexCommunication,
            (1, 2) => AlreadyDuplexCommunication,
            (2, 0) => PropertyError,
            (3, 0) => ProtocolError,
            (4, 0) => UnknownError,
            _ => UnknownCode,
        }
    }

    pub fn to_pair(self) -> (i32, i32) {
        use HandshakeResponseCode::*;

        match self {
            Success => (0, 0),
            SimplexCommunication => (0, 1),
            DuplexCommunication => (0, 2),
            AlreadyKnown => (1, 0),
            AlreadySimplexCommunication => (1, 1),
            AlreadyDuplexCommunication => (1, 2),
            PropertyError => (2, 0),
            ProtocolError => (3, 0),
            UnknownError => (4, 0),
            UnknownCode => (-1, -1),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::success(0, 0, HandshakeResponseCode::Success)]
    #[case::duplex(0, 2, HandshakeResponseCode::DuplexCommunication)]
    #[case::already_simplex(1, 1, HandshakeResponseCode::AlreadySimplexCommunication)]
    #[case::protocol_error(3, 0, HandshakeResponseCode::ProtocolError)]
    #[case::unknown_sub_code(0, 3, HandshakeResponseCode::UnknownCode)]
    #[case::unknown_code(17, 0, HandshakeResponseCode::UnknownCode)]
    fn test_from_pair(#[case] code: i32, #[case] sub_code: i32, #[case] expected: HandshakeResponseCode) {
        assert_eq!(HandshakeResponseCode::from_pair(code, sub_code), expected);
    }
}
