pub mod chain;
pub mod fees;
pub mod lightning;
pub mod logging;
pub mod shutdown;
pub mod swap;

pub mod proto {
    pub mod v1 {
        tonic::include_proto!("subswap.v1");
    }

    pub mod node {
        tonic::include_proto!("subswap.node.v1");
    }
}
