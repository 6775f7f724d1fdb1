use crate::app_state::{AppConfig, AppState};
use crate::io_struct::ChatReqInput;
use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, HttpServer, get, post, put, web};
use std::io::Write;

#[get("/health")]
pub async fn health(_req: HttpRequest, _: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

/// Upload pipeline: any PUT, any path. The request body is consumed as a raw
/// chunk stream and piped into the object store under a fresh key, so the
/// server never buffers the whole payload. The content-type header, when
/// present, is carried through as object metadata.
#[put("/{tail:.*}")]
pub async fn upload(
    req: HttpRequest,
    payload: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let key = app_state
        .ingest(content_type, payload)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(HttpResponse::Ok().body(format!("Object created with key: {}", key)))
}

/// Chat relay: deserialize the conversation, forward it to the generation
/// backend, and stream the reply text back as it arrives. Malformed payloads
/// are rejected by the Json extractor before any backend call.
#[post("/api/chat")]
pub async fn chat(
    req: web::Json<ChatReqInput>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    app_state.relay_chat(&req.messages).await
}

pub async fn startup(config: AppConfig, state: AppState) -> std::io::Result<()> {
    let app_state = web::Data::new(state);

    println!("Starting server at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .service(health)
            .service(chat)
            .service(upload)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
