pub mod invoice;
pub mod node;
