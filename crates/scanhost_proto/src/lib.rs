pub mod codec;
pub mod runtime;
pub mod testhost;
pub mod wire;
