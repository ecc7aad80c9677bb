#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = r#"
# actix-bff-gateway

A Backend For Frontend (BFF) security gateway for the [Actix web framework](https://actix.rs).

Browser frontends call the BFF under a local path, and the gateway proxies these calls to remote APIs. Access tokens stay on the server and are attached on the way out. Cookies never leave the gateway. Mutating calls from the browser must carry an anti-forgery header.

Tokens are obtained through the `TokenAcquisition` trait. `OidcTokenAcquisition` ships an implementation on top of the [openidconnect](https://docs.rs/openidconnect) crate. It reads user tokens from the `UserSession` your login flow stores in the request, and obtains client tokens with the client-credentials grant.

# Getting started

```rust,ignore
use actix_bff_gateway::{
    config::{FrontendConfiguration, FrontendStore},
    forwarder::PooledHttpClientFactory,
    frontend::Frontend,
    oidc::OidcTokenAcquisition,
    options::BffOptions,
    proxy::{BffRemoteApis, RemoteRouteHandler},
    resolver::FrontendResolution,
    route::{RemoteApiRoute, RequiredTokenType},
    token::AccessTokenRetrieverRegistry,
};
use actix_web::{App, HttpServer};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let configuration = FrontendConfiguration::new().frontend(
        Frontend::builder("shop")
            .match_path_prefix("/")
            .remote_api(
                RemoteApiRoute::new("/api/orders", "https://orders.internal/")
                    .expect("valid route")
                    .require_token(RequiredTokenType::User),
            )
            .build()
            .expect("valid frontend"),
    );
    let store = Arc::new(
        FrontendStore::new(configuration, AccessTokenRetrieverRegistry::new())
            .expect("valid configuration"),
    );

    let options = BffOptions::from_env();
    let acquisition = Arc::new(OidcTokenAcquisition::from_env().await.expect("oidc setup"));
    let clients = Arc::new(PooledHttpClientFactory::new().expect("http client"));

    HttpServer::new(move || {
        let handler = RemoteRouteHandler::new(acquisition.clone(), clients.clone(), &options)
            .expect("valid options");
        App::new()
            // Runs second: proxies calls matching a remote API of the frontend.
            .wrap(BffRemoteApis::new(handler))
            // Runs first: selects the frontend of the request.
            .wrap(FrontendResolution::new(store.clone()))
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
```

## Frontends

A frontend is selected by exactly one criterion: a path prefix, a host or an origin. Frontends are tried in declaration order and the first match wins. Overlapping criteria are logged as warnings when the configuration is built.

Requests that match no frontend, or no remote API of the selected frontend, pass through to the rest of the application untouched.

## Remote APIs

Every remote API maps a `local_path` to a `target_uri`. The local path is removed before forwarding, so with `/api/orders` mapped to `https://svc/` the call `/api/orders/42?x=1` reaches `https://svc/42?x=1`.

The `RequiredTokenType` of a route decides which token is attached:

- `None`: nothing.
- `User`: the user's token. Without a session the call is answered with `401`.
- `Client`: a client-credentials token.
- `UserOrClient`: the user's token, or the client token when there is no session.
- `UserOrNone`: the user's token if there is a session.

Paths holding a `.` or `..` segment, plain or percent-encoded, are answered with `400` and never forwarded. Inbound bodies larger than `BffOptions::max_request_body` are answered with `413`. `X-Forwarded-Host` and `X-Forwarded-Proto` are taken from the connection, never from headers the browser sent.

A route can name a custom retriever registered in the `AccessTokenRetrieverRegistry`, for instance a `TokenExchangeRetriever` exchanging the user's token for one issued to the remote API:

```rust,ignore
let registry = AccessTokenRetrieverRegistry::new().register("orders-exchange", move || {
    Arc::new(TokenExchangeRetriever::new(exchange_options.clone(), http.clone()))
        as Arc<dyn AccessTokenRetriever>
});
..
RemoteApiRoute::new("/api/orders", "https://orders.internal/")?
    .with_access_token_retriever("orders-exchange")
```

## Anti-forgery

Proxied calls must send `X-CSRF: 1` unless the route calls `skip_antiforgery()`. The header name and value come from `BffOptions`. The same check protects local BFF endpoints with the `BffApiEndpoint` middleware:

```rust,ignore
    .service(
        web::scope("/bff")
            .wrap(BffApiEndpoint::from_options(&options)?)
            .service(user_info),
    )
```

## Dynamic configuration

Routes can also come from a `RemoteApiSource`, keyed by frontend name. Routes from the source replace the code-declared routes of that frontend. `FrontendStore::reload` swaps in a new configuration atomically. Requests in flight finish with the configuration they started with.
"#]

pub mod acquisition;
pub mod antiforgery;
pub mod config;
pub(crate) mod env_var;
pub mod exchange;
pub mod forwarder;
pub mod frontend;
pub mod oidc;
pub mod options;
pub mod proxy;
pub mod resolver;
pub mod route;
pub mod token;
pub mod transform;
