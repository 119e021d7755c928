use deal_underwriting_engine::{
    advisor::{AdvisorService, HttpAdvisor, MockAdvisor},
    api::start_server,
    audit::AuditTrail,
    engine::UnderwritingEngine,
    extraction::{ExtractionService, HttpExtractionService},
    memory::PatternMemory,
    state::InMemoryDealStore,
    vendors::VendorRegistry,
    Settings,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let settings = Settings::from_env()?;

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Deal Underwriting Engine - API Server");
    info!("Port: {}", api_port);

    let extraction: Arc<dyn ExtractionService> = {
        let base_url = std::env::var("EXTRACTION_BASE_URL")
            .unwrap_or_else(|_| "https://api.extraction.example.com".to_string());
        let api_key = std::env::var("EXTRACTION_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("EXTRACTION_API_KEY not set; extraction calls will fail until configured");
        }
        Arc::new(HttpExtractionService::new(base_url, api_key))
    };

    let advisor: Arc<dyn AdvisorService> = match std::env::var("ADVISOR_API_KEY") {
        Ok(key) if !key.is_empty() => {
            let base_url = std::env::var("ADVISOR_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string());
            let model =
                std::env::var("ADVISOR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            Arc::new(HttpAdvisor::new(base_url, key, model))
        }
        _ => {
            warn!("ADVISOR_API_KEY not set; using offline advisor");
            Arc::new(MockAdvisor)
        }
    };

    let vendors = Arc::new(VendorRegistry::from_env(&settings));
    vendors.seed_defaults().await?;
    let memory = Arc::new(PatternMemory::from_env());

    let engine = Arc::new(UnderwritingEngine::new(
        settings,
        extraction,
        advisor,
        vendors,
        memory,
        Arc::new(InMemoryDealStore::new()),
        Arc::new(AuditTrail::new()),
    ));

    info!("Engine initialized");
    info!("Starting API server...");

    start_server(engine, api_port).await?;

    Ok(())
}
