mod relay;
mod sdp;

pub use relay::MediaRelay;
pub use sdp::{SdpRewrite, rewrite_sdp};
