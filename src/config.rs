use crate::{
    frontend::{Frontend, RequestTarget},
    route::{RemoteApiRoute, RemoteApiRouteConfig},
    token::{AccessTokenRetriever, AccessTokenRetrieverRegistry},
    transform::TransformCache,
};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("local_path {local_path:?} must start with '/'")]
    InvalidLocalPath { local_path: String },
    #[error("target_uri {target_uri:?} of remote API {local_path:?} must be an absolute http(s) uri: {reason}")]
    InvalidTargetUri {
        local_path: String,
        target_uri: String,
        reason: String,
    },
    #[error("Frontend name must not be empty")]
    InvalidFrontendName,
    #[error("matching_criteria of frontend {frontend:?} is invalid: {reason}")]
    InvalidMatchingCriteria { frontend: String, reason: String },
    #[error("Frontend {name:?} is configured more than once")]
    DuplicateFrontend { name: String },
    #[error("access_token_retriever {key:?} of remote API {local_path:?} in frontend {frontend:?} is not registered")]
    UnknownAccessTokenRetriever {
        frontend: String,
        local_path: String,
        key: String,
    },
    #[error("Anti-forgery header name {name:?} is not a valid header name")]
    InvalidAntiForgeryHeader { name: String },
    #[error("Remote APIs of frontend {frontend:?} from dynamic source are invalid: {source}")]
    DynamicRoute {
        frontend: String,
        #[source]
        source: Box<ConfigurationError>,
    },
}

impl ConfigurationError {
    pub(crate) fn invalid_criteria(frontend: &str, reason: String) -> Self {
        ConfigurationError::InvalidMatchingCriteria {
            frontend: frontend.to_string(),
            reason,
        }
    }
}

/// External source of remote APIs keyed by frontend name. Routes it returns
/// for a frontend replace the code-declared ones.
pub trait RemoteApiSource: Send + Sync {
    fn remote_apis_for(&self, frontend: &str) -> Option<Vec<RemoteApiRouteConfig>>;
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(transparent)]
pub struct InMemoryRemoteApiSource {
    frontends: HashMap<String, Vec<RemoteApiRouteConfig>>,
}

impl InMemoryRemoteApiSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn insert(&mut self, frontend: impl Into<String>, routes: Vec<RemoteApiRouteConfig>) {
        self.frontends.insert(frontend.into(), routes);
    }
}

impl RemoteApiSource for InMemoryRemoteApiSource {
    fn remote_apis_for(&self, frontend: &str) -> Option<Vec<RemoteApiRouteConfig>> {
        self.frontends.get(frontend).cloned()
    }
}

/// Code-declared frontends, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct FrontendConfiguration {
    frontends: Vec<Frontend>,
}

impl FrontendConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frontend(mut self, frontend: Frontend) -> Self {
        self.frontends.push(frontend);
        self
    }

    pub fn frontends(&self) -> &[Frontend] {
        &self.frontends
    }
}

/// An immutable view of all frontends together with everything built from them.
pub struct FrontendSnapshot {
    frontends: Vec<Arc<Frontend>>,
    retrievers: HashMap<String, Arc<dyn AccessTokenRetriever>>,
    transforms: TransformCache,
}

impl FrontendSnapshot {
    pub fn build(
        configuration: &FrontendConfiguration,
        source: Option<&dyn RemoteApiSource>,
        registry: &AccessTokenRetrieverRegistry,
    ) -> Result<Self, ConfigurationError> {
        let mut frontends: Vec<Arc<Frontend>> = Vec::with_capacity(configuration.frontends.len());
        let mut retrievers = HashMap::new();

        for declared in &configuration.frontends {
            if frontends.iter().any(|f| f.name() == declared.name()) {
                return Err(ConfigurationError::DuplicateFrontend {
                    name: declared.name().to_string(),
                });
            }

            let frontend = match source.and_then(|s| s.remote_apis_for(declared.name())) {
                Some(configs) => {
                    log::debug!(
                        "remote APIs of frontend {} replaced by dynamic source.",
                        declared.name()
                    );
                    declared.with_remote_apis(Self::routes_from_source(declared.name(), configs)?)
                }
                None => declared.clone(),
            };

            for route in frontend.remote_apis() {
                if let Some(key) = route.access_token_retriever() {
                    if !retrievers.contains_key(key) {
                        let retriever = registry.create(&frontend, route, key)?;
                        retrievers.insert(key.to_string(), retriever);
                    }
                }
            }
            frontends.push(Arc::new(frontend));
        }

        for warning in overlap_warnings(&frontends) {
            log::warn!("{}", warning);
        }

        Ok(Self {
            frontends,
            retrievers,
            transforms: TransformCache::default(),
        })
    }

    fn routes_from_source(
        frontend: &str,
        configs: Vec<RemoteApiRouteConfig>,
    ) -> Result<Vec<RemoteApiRoute>, ConfigurationError> {
        let mut routes: Vec<RemoteApiRoute> = Vec::with_capacity(configs.len());
        for config in configs {
            let route =
                RemoteApiRoute::try_from(config).map_err(|err| ConfigurationError::DynamicRoute {
                    frontend: frontend.to_string(),
                    source: Box::new(err),
                })?;
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    /// First frontend in declaration order whose criteria match.
    pub fn resolve(&self, target: &RequestTarget) -> Option<Arc<Frontend>> {
        self.frontends.iter().find(|f| f.matches(target)).cloned()
    }

    pub fn frontends(&self) -> &[Arc<Frontend>] {
        &self.frontends
    }

    pub fn frontend(&self, name: &str) -> Option<&Arc<Frontend>> {
        self.frontends.iter().find(|f| f.name() == name)
    }

    pub(crate) fn retriever(&self, key: &str) -> Option<&Arc<dyn AccessTokenRetriever>> {
        self.retrievers.get(key)
    }

    pub(crate) fn transforms(&self) -> &TransformCache {
        &self.transforms
    }
}

impl fmt::Debug for FrontendSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontendSnapshot")
            .field("frontends", &self.frontends)
            .field("retrievers", &self.retrievers.keys())
            .finish()
    }
}

pub(crate) fn overlap_warnings(frontends: &[Arc<Frontend>]) -> Vec<String> {
    let mut warnings = Vec::new();
    for (i, first) in frontends.iter().enumerate() {
        for second in &frontends[i + 1..] {
            if first.criteria().overlaps(second.criteria()) {
                warnings.push(format!(
                    "Frontend {:?} ({}) overlaps frontend {:?} ({}); {:?} wins as it is declared first.",
                    first.name(),
                    first.criteria(),
                    second.name(),
                    second.criteria(),
                    first.name()
                ));
            }
        }
    }
    warnings
}

/// Holds the current [`FrontendSnapshot`]. Reloads publish a new snapshot
/// atomically; requests keep the snapshot they started with.
pub struct FrontendStore {
    configuration: FrontendConfiguration,
    registry: AccessTokenRetrieverRegistry,
    current: ArcSwap<FrontendSnapshot>,
}

impl FrontendStore {
    pub fn new(
        configuration: FrontendConfiguration,
        registry: AccessTokenRetrieverRegistry,
    ) -> Result<Self, ConfigurationError> {
        Self::with_source(configuration, registry, None)
    }

    pub fn with_source(
        configuration: FrontendConfiguration,
        registry: AccessTokenRetrieverRegistry,
        source: Option<&dyn RemoteApiSource>,
    ) -> Result<Self, ConfigurationError> {
        let snapshot = FrontendSnapshot::build(&configuration, source, &registry)?;
        Ok(Self {
            configuration,
            registry,
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn snapshot(&self) -> Arc<FrontendSnapshot> {
        self.current.load_full()
    }

    /// Rebuilds from the code-declared frontends and `source`. On error the
    /// current snapshot stays in place.
    pub fn reload(&self, source: Option<&dyn RemoteApiSource>) -> Result<(), ConfigurationError> {
        let snapshot = FrontendSnapshot::build(&self.configuration, source, &self.registry)
            .inspect_err(|err| log::error!("Frontend configuration reload rejected: {}.", err))?;
        self.current.store(Arc::new(snapshot));
        log::info!("Frontend configuration reloaded.");
        Ok(())
    }
}
