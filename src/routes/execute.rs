use actix_web::{HttpResponse, Responder, post, web};

use super::ErrorResponseWithMessage;
use crate::error::EngineError;
use crate::judge::{Engine, ExecutionRequest};

#[post("/execute")]
pub async fn post_execute_handler(
    engine: web::Data<Engine>,
    body: web::Json<ExecutionRequest>,
) -> impl Responder {
    match engine.execute(&body).await {
        Ok(result) => {
            log::info!(
                "Executed {} submission, success={}",
                body.language,
                result.success()
            );
            HttpResponse::Ok().json(result)
        }
        Err(e) => error_response(e),
    }
}

fn error_response(err: EngineError) -> HttpResponse {
    let message = err.to_string();
    if err.is_infrastructure() {
        log::error!("Execution aborted: {message}");
    }
    match err {
        EngineError::UnsupportedLanguage(_) => {
            HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message,
            })
        }
        EngineError::InvalidRequest(_) | EngineError::NoTestCases { .. } => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message,
            })
        }
        EngineError::RunnerUnavailable(_) => {
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_EXTERNAL",
                code: 5,
                message,
            })
        }
        EngineError::WorkspaceIo { .. } | EngineError::Cancelled => {
            HttpResponse::InternalServerError().json(ErrorResponseWithMessage {
                reason: "ERR_INTERNAL",
                code: 6,
                message,
            })
        }
    }
}
