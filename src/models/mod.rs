pub mod cond_unet;
pub mod reference_encoder;
pub mod vae;

pub use cond_unet::{CondUNet2D, CondUNetConfig};
pub use reference_encoder::ReferenceEncoder;
pub use vae::VaeEncoder;
