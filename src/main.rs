use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let code = vm_cluster::cli::run().await;
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
