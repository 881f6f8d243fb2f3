// ./api/src/main.rs
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Application layer: manager, factory and error type
use application::{ApplicationError, EntityManager, EntityManagerFactory, ManagerConfig};
// Domain types used directly in request bodies
use domain::{DomainError, EntityId, Identified, IdentityResolver, Permission};
// Infrastructure layer implementations
use infrastructure::{InMemoryIndexStore, InMemoryPrimaryStore};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PEOPLE_INDEX: &str = "people";

/// The record type served by this binary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Person {
    #[serde(default)]
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    age: Option<u32>,
}

impl Identified for Person {
    fn identity(&self) -> String {
        self.id.clone()
    }
}

/// Body of `POST /people`.
#[derive(Deserialize, Debug)]
struct CreatePersonRequest {
    person: Person,
    #[serde(default)]
    permissions: Vec<Permission>,
}

#[derive(Clone)]
struct AppState {
    people: Arc<EntityManager<Person>>,
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    let port = read_port();
    let people_index = env::var("PEOPLE_INDEX").unwrap_or_else(|_| {
        info!(
            "PEOPLE_INDEX environment variable not set. Using default index '{}'.",
            DEFAULT_PEOPLE_INDEX
        );
        DEFAULT_PEOPLE_INDEX.to_string()
    });

    // --- Dependency Injection ---
    // 1. Create infrastructure components (one shared handle per backend)
    let primary_store = Arc::new(InMemoryPrimaryStore::new());
    let index_store = Arc::new(InMemoryIndexStore::new());
    info!("In-memory infrastructure components initialized.");

    // 2. Create entity managers, injecting dependencies
    let factory = EntityManagerFactory::new(primary_store, index_store, ManagerConfig::from_env());
    let people = Arc::new(factory.create(&people_index, IdentityResolver::identified()));
    info!(index = %people_index, "Entity managers initialized.");

    let app_state = AppState { people };

    // --- API Router Definition ---
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/people", post(create_person_handler))
        .route(
            "/people/:id",
            get(get_person_handler)
                .put(update_person_handler)
                .delete(delete_person_handler),
        )
        .route("/people/:id/document", get(get_document_handler))
        .route("/permissions/grant", post(grant_permission_handler))
        .route("/permissions/revoke", post(revoke_permission_handler))
        .with_state(app_state);

    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server starting on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn read_port() -> u16 {
    match env::var("PORT") {
        Ok(port_str) => match u16::from_str(&port_str) {
            Ok(port_num) => {
                info!("Using port {} from environment variable PORT.", port_num);
                port_num
            }
            Err(_) => {
                warn!(
                    "Invalid PORT value '{}' in environment variable. Using default port {}.",
                    port_str, DEFAULT_PORT
                );
                DEFAULT_PORT
            }
        },
        Err(_) => {
            info!(
                "PORT environment variable not set. Using default port {}.",
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    }
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, "OK")
}

/// Handler for creating a person (POST /people).
async fn create_person_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreatePersonRequest>,
) -> Response {
    info!(person_id = %payload.person.id, permissions = payload.permissions.len(), "Received request to create person");
    if payload.person.id.trim().is_empty() {
        return map_application_error_to_response(ApplicationError::InvalidArgument(
            "person.id cannot be blank".to_string(),
        ));
    }
    match state
        .people
        .create(&payload.person, &payload.permissions)
        .await
    {
        Ok(outcome) => {
            if !outcome.is_indexed() {
                warn!(person_id = %outcome.id, "Person saved but not indexed");
            }
            (StatusCode::CREATED, JsonResponse(outcome)).into_response()
        }
        Err(e) => {
            error!("Failed to create person via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for reading the primary record (GET /people/:id).
async fn get_person_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(person_id = %id, "Received request to get person");
    match state.people.find(&EntityId::new(id.clone())).await {
        Ok(Some(person)) => (StatusCode::OK, JsonResponse(person)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("Person '{}' not found", id)).into_response(),
        Err(e) => {
            error!(person_id = %id, "Failed to get person via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for reading the indexed copy (GET /people/:id/document).
async fn get_document_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(person_id = %id, "Received request to get indexed document");
    match state.people.indexed_document(&EntityId::new(id.clone())).await {
        Ok(Some(document)) => (StatusCode::OK, JsonResponse(document)).into_response(),
        Ok(None) => {
            (StatusCode::NOT_FOUND, format!("Document '{}' not found", id)).into_response()
        }
        Err(e) => {
            error!(person_id = %id, "Failed to get indexed document via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for updating a person (PUT /people/:id). The path id wins over the body.
async fn update_person_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut person): Json<Person>,
) -> Response {
    info!(person_id = %id, "Received request to update person");
    person.id = id;
    match state.people.update(&person).await {
        Ok(receipt) => (StatusCode::OK, JsonResponse(receipt)).into_response(),
        Err(e) => {
            error!(person_id = %person.id, "Failed to update person via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for deleting a person (DELETE /people/:id).
async fn delete_person_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(person_id = %id, "Received request to delete person");
    match state.people.delete(&EntityId::new(id.clone())).await {
        Ok(()) => (StatusCode::NO_CONTENT, "").into_response(),
        Err(e) => {
            error!(person_id = %id, "Failed to delete person via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for granting a permission (POST /permissions/grant).
async fn grant_permission_handler(
    State(state): State<AppState>,
    Json(permission): Json<Permission>,
) -> Response {
    info!(resource_id = ?permission.resource_id, token = %permission.token(), "Received request to grant permission");
    match state.people.grant_permission(&permission).await {
        Ok(receipt) => (StatusCode::OK, JsonResponse(receipt)).into_response(),
        Err(e) => {
            error!("Failed to grant permission via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for revoking a permission (POST /permissions/revoke).
async fn revoke_permission_handler(
    State(state): State<AppState>,
    Json(permission): Json<Permission>,
) -> Response {
    info!(resource_id = ?permission.resource_id, token = %permission.token(), "Received request to revoke permission");
    match state.people.revoke_permission(&permission).await {
        Ok(receipt) => (StatusCode::OK, JsonResponse(receipt)).into_response(),
        Err(e) => {
            error!("Failed to revoke permission via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Maps ApplicationError variants to HTTP status codes and a response body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let (status, body) = error_status(err);
    (status, body).into_response()
}

fn error_status(err: ApplicationError) -> (StatusCode, String) {
    match err {
        ApplicationError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg),
        e @ ApplicationError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        e @ ApplicationError::Conflict { .. } => (StatusCode::CONFLICT, e.to_string()),
        ApplicationError::Backend { store, reason } => {
            error!(store = %store, "Underlying backend error: {}", reason);
            (
                StatusCode::BAD_GATEWAY,
                format!("The {} store is unavailable", store),
            )
        }
        ApplicationError::Domain(e @ DomainError::IdentityResolution { .. }) => {
            error!("Entity type misconfigured: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal server error occurred".to_string(),
            )
        }
        ApplicationError::Domain(domain_err) => {
            warn!("Domain validation failed: {}", domain_err);
            (StatusCode::BAD_REQUEST, domain_err.to_string())
        }
        ApplicationError::Serialization(e) => {
            warn!("Payload could not be serialized: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        e @ ApplicationError::CorruptRecord { .. } => {
            error!("Stored data is unreadable: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal server error occurred".to_string(),
            )
        }
    }
}
