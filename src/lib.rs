pub mod capture;
pub mod decode;
pub mod ring;
mod socket;

/// Maximum number of decoded layers per frame: link, network, transport, payload.
pub const LAYER_MAX: usize = 4;
