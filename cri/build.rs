fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/runtime_v1.proto"], &["proto"])?;
    Ok(())
}
