pub mod in_process;
pub mod kafka_publisher;
pub mod redis_room_channel;
pub mod reply_consumer;

pub use in_process::InProcessRoomBus;
pub use kafka_publisher::KafkaAuthRequestPublisher;
pub use redis_room_channel::RedisRoomChannel;
pub use reply_consumer::{AuthReplyConsumer, dispatch_reply};
