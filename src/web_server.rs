use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::judge::Engine;
use crate::routes::{exit, get_languages_handler, json_error_handler, post_execute_handler};

pub fn build_server(server_config: ServerConfig, engine: web::Data<Engine>) -> std::io::Result<Server> {
    let ServerConfig {
        bind_address,
        bind_port,
    } = server_config;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_execute_handler)
            .service(get_languages_handler)
            .service(exit)
    })
    .bind((bind_address, bind_port))?
    .run();

    Ok(server)
}
