pub mod h264;
pub mod h265;

/// Media codec carried by a track.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Aac,
    Opus,
    Mp3,
}

impl Codec {
    pub fn is_video(&self) -> bool {
        matches!(self, Codec::H264 | Codec::H265)
    }
}
