fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This script tells Cargo to re-run if the .proto file changes.
    // It maps the shared provider protobuf definition into the 'pb' module.

    println!("cargo:rerun-if-changed=proto/rootmod/provider/v1/provider.proto");

    // Point prost-build at the bundled protoc so builds don't depend on a
    // system-wide `protoc` installation.
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_build::configure()
        // Both halves of the channel live in this crate: the daemon serves
        // the schema and the provider client consumes it.
        .build_client(true)
        .build_server(true)
        .compile(
            &["proto/rootmod/provider/v1/provider.proto"], // Path to the shared definition
            &["proto"],                                    // Include paths for imports
        )?;

    Ok(())
}
