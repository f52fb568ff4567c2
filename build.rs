fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/subswap/v1/swapper.proto", "proto/subswap/node/v1/node.proto"],
            &["proto"],
        )?;

    Ok(())
}
