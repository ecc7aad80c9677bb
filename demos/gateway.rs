use actix_bff_gateway::{
    antiforgery::BffApiEndpoint,
    config::{FrontendConfiguration, FrontendStore},
    forwarder::PooledHttpClientFactory,
    frontend::Frontend,
    oidc::OidcTokenAcquisition,
    options::BffOptions,
    proxy::{BffRemoteApis, RemoteRouteHandler},
    resolver::{FrontendResolution, SelectedFrontend},
    route::{RemoteApiRoute, RequiredTokenType},
    token::AccessTokenRetrieverRegistry,
};
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use dotenv::dotenv;
use env_logger::Env;
use std::{
    io::{Error, ErrorKind},
    sync::Arc,
};

#[get("/frontend")]
async fn frontend_info(selected: SelectedFrontend) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "name": selected.name(),
        "remote_apis": selected
            .frontend()
            .remote_apis()
            .iter()
            .map(|r| r.local_path())
            .collect::<Vec<_>>(),
    }))
}

fn configuration() -> Result<FrontendConfiguration, Error> {
    let admin = Frontend::builder("admin")
        .match_path_prefix("/admin")
        .remote_api(
            RemoteApiRoute::new("/admin/api/users", "http://localhost:5001/users")
                .map_err(|err| Error::new(ErrorKind::Other, err))?
                .require_token(RequiredTokenType::User),
        )
        .build()
        .map_err(|err| Error::new(ErrorKind::Other, err))?;

    let shop = Frontend::builder("shop")
        .match_path_prefix("/")
        .remote_api(
            RemoteApiRoute::new("/api/catalog", "http://localhost:5002/")
                .map_err(|err| Error::new(ErrorKind::Other, err))?
                .require_token(RequiredTokenType::UserOrNone)
                .allow_response_buffering(true),
        )
        .remote_api(
            RemoteApiRoute::new("/api/orders", "http://localhost:5003/")
                .map_err(|err| Error::new(ErrorKind::Other, err))?
                .require_token(RequiredTokenType::UserOrClient),
        )
        .build()
        .map_err(|err| Error::new(ErrorKind::Other, err))?;

    // Declared first so /admin is not swallowed by the catch-all shop frontend.
    Ok(FrontendConfiguration::new().frontend(admin).frontend(shop))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let store = Arc::new(
        FrontendStore::new(configuration()?, AccessTokenRetrieverRegistry::new())
            .map_err(|err| Error::new(ErrorKind::Other, err))?,
    );
    let options = BffOptions::from_env();
    let acquisition = Arc::new(
        OidcTokenAcquisition::from_env()
            .await
            .map_err(|err| Error::new(ErrorKind::Other, err))?,
    );
    let clients =
        Arc::new(PooledHttpClientFactory::new().map_err(|err| Error::new(ErrorKind::Other, err))?);
    let endpoint =
        BffApiEndpoint::from_options(&options).map_err(|err| Error::new(ErrorKind::Other, err))?;

    HttpServer::new(move || {
        let handler = RemoteRouteHandler::new(acquisition.clone(), clients.clone(), &options)
            .expect("options were validated at startup");
        App::new()
            .service(
                web::scope("/bff")
                    .wrap(endpoint.clone())
                    .service(frontend_info),
            )
            .wrap(BffRemoteApis::new(handler))
            .wrap(FrontendResolution::new(store.clone()))
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
