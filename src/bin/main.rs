use deposit_rate_assistant::{
    config::{AppConfig, LlmProvider},
    models::ResumePayload,
    workflow::Orchestrator,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Client turns replayed by the demo
const MOCKED_MESSAGES: [&str; 3] = [
    "Please clarify the current balances on our accounts.",
    "Yes, let's deposit the entire amount currently available in our accounts.",
    "Let's do it for 10 days.",
];

/// The client corrects the amount at the confirmation checkpoint
const CORRECTED_AMOUNT: i64 = 505_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    if config.provider == LlmProvider::Mock {
        info!("Running the demo with the offline model");
    }

    let orchestrator = Orchestrator::from_config(&config).await?;
    let session_id = Uuid::new_v4();
    let mut transcript = Vec::new();

    for message in MOCKED_MESSAGES {
        let outcome = orchestrator.handle_message(session_id, message).await?;
        transcript.extend(outcome.messages);

        if let Some(request) = outcome.confirmation {
            println!("\n=== APPROVAL REQUEST ===");
            println!("Type: {}", request.kind);
            println!("Question: {}", request.question);
            println!("Proposed amount: {}", request.proposed_amount);
            println!("Proposed duration: {}", request.proposed_duration);
            println!("Request id: {}", request.request_id);
        }
    }

    println!("\nResuming with deposit_amount = {}", CORRECTED_AMOUNT);
    let outcome = orchestrator
        .resume(
            session_id,
            ResumePayload {
                deposit_amount: Some(CORRECTED_AMOUNT),
                ..ResumePayload::default()
            },
        )
        .await?;
    transcript.extend(outcome.messages);

    println!("\n=== CONVERSATION ===");
    for message in &transcript {
        println!("{}", message.pretty());
    }

    if let Some(rates) = outcome.rates {
        println!(
            "Final stage: {} | rates {}-{}% | agreed {}%",
            outcome.stage.name(),
            rates.min_rate,
            rates.max_rate,
            rates.agreed_rate
        );
    } else {
        println!("Final stage: {}", outcome.stage.name());
    }

    Ok(())
}
