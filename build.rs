fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
        std::env::set_var("PROTOC", protoc);
    }
    tonic_build::compile_protos("proto/raft.proto")?;
    println!("cargo:rerun-if-changed=proto/raft.proto");
    Ok(())
}
