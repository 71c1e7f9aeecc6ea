use std::process::ExitCode;

fn main() -> ExitCode {
    mp_rred::init_tracing();

    match mp_rred::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}
