use num_enum::{FromPrimitive, IntoPrimitive};

/// Status code carried by stream-create-fail and stream-close packets. Codes are grouped by
///  category in steps of ten; values that are unknown locally decode as [StreamCode::UnknownError].
#[repr(i16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
pub enum StreamCode {
    Ok = 0,

    #[num_enum(default)]
    UnknownError = 100,

    IdError = 110,
    IdIllegal = 111,
    IdDuplicated = 112,
    IdNotFound = 113,

    StateError = 120,
    StateNotConnected = 121,
    StateClosed = 122,

    TypeError = 130,
    TypeUnknown = 131,
    TypeUnsupport = 132,

    PacketError = 140,
    PacketUnknown = 141,
    PacketUnsupport = 142,

    ConnectionError = 150,
    ConnectionNotFound = 151,
    ConnectionTimeout = 152,
    ConnectionUnsupport = 153,

    RouteError = 160,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ok(0, StreamCode::Ok)]
    #[case::id_not_found(113, StreamCode::IdNotFound)]
    #[case::unsupported(153, StreamCode::ConnectionUnsupport)]
    #[case::unknown(99, StreamCode::UnknownError)]
    #[case::negative(-5, StreamCode::UnknownError)]
    fn test_from_raw(#[case] raw: i16, #[case] expected: StreamCode) {
        assert_eq!(StreamCode::from(raw), expected);
    }
}
