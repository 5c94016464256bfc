use speedwatch_client::render::{progress_line, summary};
use speedwatch_client::{
    init_logging, load_config, ConsumerState, Failure, HubClient, MeasurementSession,
    StreamConsumer,
};
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = load_config();
    init_logging(config.debug);

    let client = match HubClient::new(
        &config.hub_url,
        config.api_token.clone(),
        config.validate_timeout,
    ) {
        Ok(client) => client,
        Err(err) => {
            error!(event = "client_init_failed", error = %err);
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let session = MeasurementSession::new(client);
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut request = config.request();
    let mut consumer = match run_once(&session, &request).await {
        Some(consumer) => consumer,
        None => return ExitCode::from(2),
    };

    let alternative = match consumer.failure() {
        Some(Failure::IdentityMismatch {
            alternative: Some(alternative),
            ..
        }) if config.accept_detected => Some(alternative.clone()),
        _ => None,
    };
    if let Some(alternative) = alternative {
        info!(event = "accepting_detected_provider", isp = %alternative);
        println!("using detected provider {alternative}");
        request = request.with_claimed_isp(alternative, true);
        consumer = match run_once(&session, &request).await {
            Some(consumer) => consumer,
            None => return ExitCode::from(2),
        };
    }

    println!("{}", summary(&consumer));
    match consumer.state() {
        ConsumerState::Complete => ExitCode::SUCCESS,
        ConsumerState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

async fn run_once(
    session: &MeasurementSession,
    request: &speedwatch_core::MeasurementRequest,
) -> Option<StreamConsumer> {
    let mut stdout = std::io::stdout();
    let result = session
        .run(request, |consumer| {
            if consumer.is_terminal() {
                let _ = writeln!(stdout);
            } else {
                let _ = write!(stdout, "\r{}", progress_line(consumer));
            }
            let _ = stdout.flush();
        })
        .await;
    match result {
        Ok(consumer) => Some(consumer),
        Err(err) => {
            error!(event = "measurement_run_failed", error = %err);
            eprintln!("{err}");
            None
        }
    }
}
