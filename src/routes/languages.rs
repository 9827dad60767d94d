use actix_web::{HttpResponse, Responder, get};
use serde::Serialize;

use crate::language::Language;

#[derive(Serialize)]
struct LanguageEntry {
    name: &'static str,
    compiled: bool,
    source_name: &'static str,
}

#[get("/languages")]
pub async fn get_languages_handler() -> impl Responder {
    let languages: Vec<LanguageEntry> = Language::ALL
        .iter()
        .map(|language| {
            let profile = language.profile();
            LanguageEntry {
                name: profile.tag,
                compiled: profile.compile_command.is_some(),
                source_name: profile.source_name,
            }
        })
        .collect();

    HttpResponse::Ok().json(languages)
}
