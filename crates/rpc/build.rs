fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(
            &[
                "proto/agent.proto",
                "proto/exec.proto",
                "proto/process.proto",
                "proto/worktree.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
