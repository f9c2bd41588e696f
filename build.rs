fn main() -> Result<(), Box<dyn std::error::Error>> {
    // the control service is only served here, clients live elsewhere
    tonic_build::configure()
        .build_client(false)
        .compile(&["proto/transcoder.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/transcoder.proto");

    // transcoders rely on PR_SET_PDEATHSIG
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        panic!("This program only runs on linux");
    }
    Ok(())
}
