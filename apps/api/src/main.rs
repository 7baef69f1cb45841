use std::net::SocketAddr;
use std::sync::Arc;

use btb_citation::{
    audit::AuditValidator,
    extract::{ExtractorRegistry, ServiceExtractor, MAX_PDF_PAGES},
    session::{ChatSession, SubmissionSlot, Workspace},
};
use btb_llm::make_model;
use dotenv::dotenv;
use tokio::sync::RwLock;
use tracing::info;

mod config;
mod routes;
mod store;

use config::{load_config, AppConfig};
use routes::{router, AppState};
use store::{load_or_default, MemoryMetadataStore, MetadataStore, SledMetadataStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg: AppConfig = load_config()?;

    let model: Arc<dyn btb_llm::ModelClient> = Arc::from(
        make_model(cfg.model_provider_config()?).map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );
    info!(kind = %cfg.model_provider.kind, model = %cfg.model_provider.model, "model provider ready");

    let service_extractor = |ex: &config::ExtractorCfg| {
        ex.url.as_ref().map(|url| {
            let token = ex.token_env.as_ref().and_then(|k| std::env::var(k).ok());
            ServiceExtractor::new(url.clone(), token, ex.timeout())
        })
    };
    let (extractors, extract_service) = match cfg.extractor.as_ref() {
        Some(ex) => {
            let mut registry = ExtractorRegistry::new(ex.max_pdf_pages());
            if let Some(service) = service_extractor(ex) {
                info!(url = ?ex.url, "rich document extraction delegated to service");
                registry = registry.with_rich_extractor(Box::new(service));
            }
            (registry, service_extractor(ex).map(Arc::new))
        }
        None => (ExtractorRegistry::new(MAX_PDF_PAGES), None),
    };

    let store: Arc<dyn MetadataStore> = match cfg.storage.persistent_path() {
        Some(path) => Arc::new(SledMetadataStore::open(path)?),
        None => {
            info!("storage path empty, project settings kept in memory only");
            Arc::new(MemoryMetadataStore::default())
        }
    };
    let metadata = load_or_default(store.as_ref());
    info!(project = %metadata.name, "project snapshot loaded");

    let budget = cfg.limits.budget();
    let state = AppState {
        workspace: Arc::new(RwLock::new(Workspace::new(metadata))),
        chat: Arc::new(ChatSession::new(model.clone(), budget.chat_doc_chars)),
        auditor: Arc::new(AuditValidator::new(model, budget)),
        extractors: Arc::new(extractors),
        extract_service,
        store,
        chat_slot: Arc::new(SubmissionSlot::new("chat")),
        audit_slot: Arc::new(SubmissionSlot::new("audit")),
        max_upload_bytes: cfg.limits.max_upload_bytes,
    };

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "btb-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
