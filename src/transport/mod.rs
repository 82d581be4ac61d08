pub mod channel;
pub mod traits;

pub use channel::{ChannelTransport, OutboundMessage};
pub use traits::Transport;
