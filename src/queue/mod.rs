pub mod amqp;
pub mod channel;
pub mod codec;
pub mod memory;
pub mod redis;
pub mod transport;

// Re-export common types
pub use amqp::{AmqpParams, AmqpTransport};
pub use channel::{AckHandle, Channel, ChannelError, Consumer, Delivery};
pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;
pub use transport::{QueueBinding, SendOutcome, Transport, TransportError};
