fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc_path);
    println!("cargo:rerun-if-changed=proto/resource/resource.proto");

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&["proto/resource/resource.proto"], &["proto/resource"])?;

    Ok(())
}
