//! HTTP API over the retrieval engine.
//!
//! The engine is built once in `main` and handed in by value; handlers share
//! it through an `Arc` and only ever take `&self`, so requests run in
//! parallel without locking. Encoder inference is blocking, hence the
//! `block_in_place` around every engine call.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::encoder::EncodeError;
use crate::retrieval::{
    ChapterDetail, ChapterSummary, EngineError, EngineStats, FusedResults, KnowledgeEngine,
    RagContext, SearchHit,
};

const DEFAULT_TOP_K: usize = 5;

/// Options for the HTTP daemon.
pub struct ServeOpts {
    pub listen: String,
    /// Knowledge image directory served under `/images`
    pub image_dir: Option<PathBuf>,
}

struct SharedState {
    engine: KnowledgeEngine,
}

pub fn start_daemon(engine: KnowledgeEngine, opts: ServeOpts) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(engine, opts).await });
}

async fn start_app(engine: KnowledgeEngine, opts: ServeOpts) {
    let state = Arc::new(SharedState { engine });
    let app = router(state, opts.image_dir);

    let listener = tokio::net::TcpListener::bind(&opts.listen).await.unwrap();
    log::info!("listening on {}", opts.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn router(state: Arc<SharedState>, image_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/search/text", post(search_text))
        .route("/search/image", post(search_image))
        .route("/chapters", get(chapters))
        .route("/chapter/:chapter_number", get(chapter))
        .route("/rag/generate", post(rag_generate));

    if let Some(dir) = image_dir {
        app = app.nest_service("/images", tower_http::services::ServeDir::new(dir));
    }

    app.layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

/// Error wrapper that decides the HTTP status per failure class.
#[derive(Debug)]
enum HttpError {
    Engine(EngineError),
    Base64(base64::DecodeError),
    NotAnImage,
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl From<base64::DecodeError> for HttpError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Base64(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match &self {
            HttpError::Engine(EngineError::ChapterNotFound(_)) => (
                axum::http::StatusCode::NOT_FOUND,
                json!({"error": "chapter not found"}).to_string(),
            ),
            HttpError::Engine(EngineError::Encode(EncodeError::UnreadableImage(err))) => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": format!("unreadable query image: {err}")}).to_string(),
            ),
            HttpError::Engine(err) => {
                log::error!("{err:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": err.to_string()}).to_string(),
                )
            }
            HttpError::Base64(err) => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": format!("invalid base64 image: {err}")}).to_string(),
            ),
            HttpError::NotAnImage => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": "uploaded data is not an image"}).to_string(),
            ),
        }
        .into_response()
    }
}

/// Response envelope shared by all search endpoints.
#[derive(Debug, Serialize)]
struct SearchResponse<T: Serialize> {
    success: bool,
    data: T,
    message: String,
}

impl<T: Serialize> SearchResponse<T> {
    fn ok(data: T, message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database_info: EngineStats,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        database_info: state.engine.stats(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum QueryMode {
    Text,
    Image,
    Multimodal,
    Rag,
}

#[derive(Debug, Clone, Deserialize)]
struct TextQueryRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    min_score: Option<f32>,
    #[serde(default = "default_mode")]
    mode: QueryMode,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_mode() -> QueryMode {
    QueryMode::Multimodal
}

#[derive(Debug, Serialize)]
struct ModeResults {
    query: String,
    mode: QueryMode,
    results: Vec<SearchHit>,
    total_count: usize,
}

#[derive(Debug, Serialize)]
struct MultimodalResults {
    query: String,
    #[serde(flatten)]
    results: FusedResults,
}

#[derive(Debug, Serialize)]
struct RagResults {
    query: String,
    #[serde(flatten)]
    context: RagContext,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TextSearchData {
    Mode(ModeResults),
    Multimodal(MultimodalResults),
    Rag(RagResults),
}

async fn search_text(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TextQueryRequest>,
) -> Result<Json<SearchResponse<TextSearchData>>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let engine = &state.engine;
        let data = match payload.mode {
            QueryMode::Text => {
                let results =
                    engine.search_text(&payload.query, payload.top_k, payload.min_score)?;
                TextSearchData::Mode(ModeResults {
                    total_count: results.len(),
                    query: payload.query,
                    mode: payload.mode,
                    results,
                })
            }
            QueryMode::Image => {
                let results =
                    engine.search_images(&payload.query, payload.top_k, payload.min_score)?;
                TextSearchData::Mode(ModeResults {
                    total_count: results.len(),
                    query: payload.query,
                    mode: payload.mode,
                    results,
                })
            }
            QueryMode::Multimodal => {
                let results = engine.multimodal_search(&payload.query, payload.top_k, None, None)?;
                TextSearchData::Multimodal(MultimodalResults {
                    query: payload.query,
                    results,
                })
            }
            QueryMode::Rag => {
                let context = engine.generate_rag_context(&payload.query, None)?;
                TextSearchData::Rag(RagResults {
                    query: payload.query,
                    context,
                })
            }
        };

        Ok(SearchResponse::ok(data, "search complete"))
    })
}

#[derive(Deserialize)]
struct ImageQueryRequest {
    image_b64: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    min_score: Option<f32>,
}

impl Debug for ImageQueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ImageQueryRequest {{ image_b64: [REDACTED], top_k: {:?}, min_score: {:?} }}",
            self.top_k, self.min_score
        )
    }
}

#[derive(Debug, Serialize)]
struct ImageSearchData {
    similar_images: Vec<SearchHit>,
    related_texts: Vec<SearchHit>,
}

async fn search_image(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ImageQueryRequest>,
) -> Result<Json<SearchResponse<ImageSearchData>>, HttpError> {
    log::debug!("payload: {payload:?}");

    let bytes = STANDARD.decode(payload.image_b64)?;
    if !infer::is_image(&bytes) {
        return Err(HttpError::NotAnImage);
    }

    tokio::task::block_in_place(move || {
        let (similar_images, related_texts) =
            state
                .engine
                .search_by_image(&bytes, payload.top_k, payload.min_score)?;

        Ok(SearchResponse::ok(
            ImageSearchData {
                similar_images,
                related_texts,
            },
            "image search complete",
        ))
    })
}

#[derive(Debug, Serialize)]
struct ChaptersData {
    chapters: Vec<ChapterSummary>,
    total_chapters: usize,
}

async fn chapters(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<SearchResponse<ChaptersData>>, HttpError> {
    let chapters = state.engine.chapters();
    Ok(SearchResponse::ok(
        ChaptersData {
            total_chapters: chapters.len(),
            chapters,
        },
        "chapters listed",
    ))
}

async fn chapter(
    State(state): State<Arc<SharedState>>,
    Path(chapter_number): Path<u32>,
) -> Result<Json<SearchResponse<ChapterDetail>>, HttpError> {
    let detail = state.engine.chapter(chapter_number)?;
    Ok(SearchResponse::ok(detail, "chapter content"))
}

#[derive(Debug, Serialize)]
struct RagGenerateData {
    system_prompt: String,
    user_query: String,
    context: RagContext,
    sources: Vec<String>,
}

async fn rag_generate(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TextQueryRequest>,
) -> Result<Json<SearchResponse<RagGenerateData>>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let context = state.engine.generate_rag_context(&payload.query, None)?;
        let (system_prompt, sources) = build_rag_prompt(&context);

        Ok(SearchResponse::ok(
            RagGenerateData {
                system_prompt,
                user_query: payload.query,
                context,
                sources,
            },
            "rag context generated",
        ))
    })
}

/// Render the assembled context into a system prompt for the downstream
/// answer generator, plus the deduplicated source list.
pub(crate) fn build_rag_prompt(context: &RagContext) -> (String, Vec<String>) {
    let mut prompt = String::from(
        "You are a design history expert. Answer the user's question using \
         the knowledge base content below.\n",
    );

    if !context.text_context.is_empty() {
        prompt.push_str("\nRelevant passages:\n");
        for (i, passage) in context.text_context.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. Source: {}\nContent: {}\n\n",
                i + 1,
                passage.source,
                passage.content
            ));
        }
    }

    if !context.image_context.is_empty() {
        prompt.push_str("\nRelevant images:\n");
        for (i, image) in context.image_context.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. Image: {}\nDescription: {}\nSource: {}\n\n",
                i + 1,
                image.image_url,
                image.description,
                image.source
            ));
        }
    }

    prompt.push_str(
        "\nAnswer based on the content above. If the knowledge base has no \
         relevant information, say that nothing relevant was found.\n",
    );

    let mut sources = Vec::new();
    for source in context
        .text_context
        .iter()
        .map(|p| &p.source)
        .chain(context.image_context.iter().map(|p| &p.source))
    {
        if !sources.contains(source) {
            sources.push(source.clone());
        }
    }

    (prompt, sources)
}

#[cfg(test)]
pub(crate) fn test_router(engine: KnowledgeEngine) -> Router {
    router(Arc::new(SharedState { engine }), None)
}
