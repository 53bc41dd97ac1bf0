use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("invalid RTP version")]
    ErrBadVersion,
    #[error("padding on ciphered packet must be validated after decryption")]
    ErrPaddingOnCipheredPacket,
    #[error("invalid padding size")]
    ErrBadPadding,
    #[error("NALU type {0} is unhandled")]
    ErrUnhandledNaluType(u8),
    #[error("STAP declared size({0}) is larger than buffer({1})")]
    ErrStapSizeLargerThanBuffer(usize, usize),
    #[error("corrupted h265 packet")]
    ErrH265CorruptedPacket,

    //RTCP errors
    #[error("RTCP packet too short to be read")]
    ErrPacketTooShort,
    #[error("wrong RTCP packet type")]
    ErrWrongType,
    #[error("wrong RTCP payload type")]
    ErrWrongPayloadType,
    #[error("wrong RTCP feedback message type")]
    ErrWrongFeedbackType,
    #[error("RTCP header length is too small")]
    ErrHeaderTooSmall,

    //STUN errors
    #[error("not a STUN message")]
    ErrNotStunMessage,
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("integrity check failed")]
    ErrIntegrityMismatch,
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,
    #[error("invalid length of IP value")]
    ErrBadIpLength,

    //DTLS errors
    #[error("DTLS packet is too short")]
    ErrDtlsPacketInvalidLength,
    #[error("handshake is in progress")]
    ErrHandshakeInProgress,
    #[error("invalid state machine transition")]
    ErrInvalidFsmTransition,
    #[error("alert is fatal or close notify")]
    ErrAlertFatalOrClose,
    #[error("DTLS transport has no exported keying material")]
    ErrNoSrtpKeyingMaterial,

    //SRTP errors
    #[error("no such SRTP profile")]
    ErrNoSuchSrtpProfile,
    #[error("SRTP master key is not long enough")]
    ErrShortSrtpMasterKey,
    #[error("failed to verify auth tag")]
    ErrFailedToVerifyAuthTag,
    #[error("packet is too short to be RTP packet")]
    ErrTooShortRtp,
    #[error("packet is too short to be RTCP packet")]
    ErrTooShortRtcp,

    //Network errors
    #[error("unknown packet type {0}")]
    ErrUnknownPacketType(u8),
    #[error("packet too big")]
    ErrPacketTooBig,
    #[error("session not found")]
    ErrSessionNotFound,
    #[error("udp: listener closed")]
    ErrClosedListener,
    #[error("tcp: connection closed")]
    ErrConnectionClosed,
    #[error("i/o timeout")]
    ErrTimeout,

    //Session errors
    #[error("track not found for ssrc {0}")]
    ErrTrackNotFound(u32),
    #[error("codec not found")]
    ErrCodecNotFound,
    #[error("no payload decoded for packet")]
    ErrNoPayload,
    #[error("session is disposing")]
    ErrSessionDisposing,

    //GB28181 errors
    #[error("ps: invalid pack header")]
    ErrGbPsHeader,
    #[error("ps: decode media stream failed")]
    ErrGbPsMedia,
    #[error("gb: invalid ssrc {0}")]
    ErrGbSsrcInvalid(String),
    #[error("gb: session already exists for {0}")]
    ErrGbSessionExists(String),
    #[error("gb: session not ready")]
    ErrGbSessionNotReady,

    //HTTP stream errors
    #[error("stream is disposing")]
    ErrStreamDisposing,
    #[error("stream not found")]
    ErrStreamNotFound,
    #[error("stream format {0} is not supported")]
    ErrFormatNotSupported(String),
    #[error("http: mount conflict for {0}")]
    ErrMountConflict(String),
    #[error("http: status and body already finalized")]
    ErrResponseFinalized,

    //API errors
    #[error("raw api is disabled")]
    ErrRawApiDisabled,
    #[error("invalid rpc {0}")]
    ErrApiInvalidRpc(String),

    //Source errors
    #[error("source is busy: another publisher is active")]
    ErrSourceBusy,
    #[error("consumer is gone")]
    ErrConsumerGone,

    #[error("invalid remote address: {0}")]
    InvalidRemoteAddress(SocketAddr),
    #[error("io error: {0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The numeric code surfaced by the HTTP API envelope.
    pub fn api_code(&self) -> i32 {
        match self {
            Error::ErrStreamNotFound => 2037,
            Error::ErrStreamDisposing => 2038,
            Error::ErrGbSsrcInvalid(_) => 6001,
            Error::ErrGbSessionExists(_) => 6002,
            Error::ErrRawApiDisabled => 3080,
            Error::ErrApiInvalidRpc(_) => 3081,
            _ => 1000,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
