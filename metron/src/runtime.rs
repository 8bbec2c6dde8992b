//! The runtime registry: constructs components from the configuration,
//! orders startup, and drives cooperative shutdown.
//!
//! Construction order is writers → collectors → providers: collectors
//! resolve their writers right after writers exist, and event collectors
//! resolve their provider events once providers exist (subscription is
//! deferred to start). One broadcast channel is the process-wide exit
//! signal observed by every worker.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use metron_collectors::{CollectorCore, CronCollector, EventCollector};
use metron_common::{
    Component, ConfigError, ScopeFn, ScopeValue, Signal, WorkerComponent,
    config::{Config, ComponentConfig, KIND_COLLECTORS, KIND_PROVIDERS, KIND_WRITERS},
};
use metron_providers::{
    Provider, ProviderScopeObject, csv::CsvProvider, sql::SqlProvider,
    websocket::WebSocketProvider,
};
use metron_writers::{
    Writer, WriterBackend, influxdb::InfluxDbWriter, push::PushWriter, writer::WriterSettings,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};

/// A provider as built by its factory: the operations surface, plus the
/// worker when the provider owns a background task.
pub struct BuiltProvider {
    pub provider: Arc<dyn Provider>,
    pub worker: Option<Arc<dyn WorkerComponent>>,
}

/// Constructs a writer backend from its configuration, together with the
/// default tunables for this writer kind.
pub type WriterFactory =
    Box<dyn Fn(&ComponentConfig, &Config) -> Result<(Arc<dyn WriterBackend>, WriterSettings), ConfigError> + Send + Sync>;

/// Constructs a provider from its configuration.
pub type ProviderFactory =
    Box<dyn Fn(&ComponentConfig, &Config) -> Result<BuiltProvider, ConfigError> + Send + Sync>;

enum Collector {
    Cron(Arc<CronCollector>),
    Event(Arc<EventCollector>),
}

impl Collector {
    fn core(&self) -> &Arc<CollectorCore> {
        match self {
            Self::Cron(c) => c.core(),
            Self::Event(c) => c.core(),
        }
    }

    fn worker(&self) -> Arc<dyn WorkerComponent> {
        match self {
            Self::Cron(c) => Arc::clone(c) as Arc<dyn WorkerComponent>,
            Self::Event(c) => Arc::clone(c) as Arc<dyn WorkerComponent>,
        }
    }
}

pub struct Runtime {
    config: Config,
    shutdown: broadcast::Sender<Signal>,
    writer_factories: HashMap<String, WriterFactory>,
    provider_factories: HashMap<String, ProviderFactory>,
    functions: Vec<(String, ScopeFn)>,
    writers: Vec<Arc<Writer>>,
    collectors: Vec<Collector>,
    providers: Vec<BuiltProvider>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(64);
        let mut runtime = Self {
            config,
            shutdown,
            writer_factories: HashMap::new(),
            provider_factories: HashMap::new(),
            functions: crate::functions::builtins()
                .into_iter()
                .map(|(name, func)| (name.to_string(), func))
                .collect(),
            writers: Vec::new(),
            collectors: Vec::new(),
            providers: Vec::new(),
            handles: Vec::new(),
        };
        runtime.register_builtin_classes();
        runtime
    }

    fn register_builtin_classes(&mut self) {
        self.register_writer_class(
            "influxdb",
            Box::new(|config, _| {
                let backend = InfluxDbWriter::from_config(config)?;
                Ok((Arc::new(backend) as Arc<dyn WriterBackend>, WriterSettings::default()))
            }),
        );
        self.register_writer_class(
            "push",
            Box::new(|config, _| {
                let backend = PushWriter::from_config(config)?;
                // push notifications flush on enqueue by default
                let defaults = WriterSettings {
                    write_interval: std::time::Duration::ZERO,
                    ..WriterSettings::default()
                };
                Ok((Arc::new(backend) as Arc<dyn WriterBackend>, defaults))
            }),
        );
        self.register_provider_class(
            "csv",
            Box::new(|config, _| {
                let provider = Arc::new(CsvProvider::from_config(config)?);
                Ok(BuiltProvider {
                    provider,
                    worker: None,
                })
            }),
        );
        self.register_provider_class(
            "sql",
            Box::new(|config, base| {
                let provider = Arc::new(SqlProvider::from_config(config, &base.config_dir)?);
                Ok(BuiltProvider {
                    provider,
                    worker: None,
                })
            }),
        );
        self.register_provider_class(
            "websocket",
            Box::new(|config, _| {
                let provider = Arc::new(WebSocketProvider::from_config(config)?);
                Ok(BuiltProvider {
                    provider: provider.clone(),
                    worker: Some(provider),
                })
            }),
        );
    }

    /// Registers a writer class; part of the plugin surface.
    pub fn register_writer_class(&mut self, class: &str, factory: WriterFactory) {
        self.writer_factories.insert(class.to_string(), factory);
    }

    /// Registers a provider class; part of the plugin surface.
    pub fn register_provider_class(&mut self, class: &str, factory: ProviderFactory) {
        self.provider_factories.insert(class.to_string(), factory);
    }

    /// Registers a custom function visible to every expression.
    pub fn register_function(&mut self, name: &str, func: ScopeFn) {
        self.functions.push((name.to_string(), func));
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<Signal> {
        self.shutdown.clone()
    }

    pub fn writer(&self, id: &str) -> Option<&Arc<Writer>> {
        self.writers.iter().find(|w| w.id() == id)
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers
            .iter()
            .map(|built| &built.provider)
            .find(|p| p.id() == id)
    }

    pub fn collector_core(&self, id: &str) -> Option<Arc<CollectorCore>> {
        self.collectors
            .iter()
            .find(|c| c.core().id() == id)
            .map(|c| Arc::clone(c.core()))
    }

    /// Builds every enabled component and wires the registry together.
    pub fn init(&mut self) -> anyhow::Result<()> {
        // declared custom functions must resolve to registered ones
        for (name, reference) in self.config.custom_functions() {
            if !self.functions.iter().any(|(n, _)| *n == name) {
                anyhow::bail!(
                    "the custom function '{name}' ({reference}) is not registered"
                );
            }
        }

        // writers first so collectors can resolve them
        for (id, component) in self.config.components(KIND_WRITERS) {
            if !component.enabled() {
                debug!(name = %id, "the writer {id} is disabled");
                continue;
            }
            let class = component.class()?;
            let factory = self
                .writer_factories
                .get(&class)
                .with_context(|| format!("cannot load component '{id}': unknown writer class '{class}'"))?;
            let (backend, defaults) = factory(&component, &self.config)
                .with_context(|| format!("cannot load component '{id}'"))?;
            let settings = WriterSettings::from_config(&component, defaults)?;
            let writer = Writer::new(
                id.clone(),
                backend,
                settings,
                &self.config.data_dir,
                self.config.test,
            )?;
            self.writers.push(Arc::new(writer));
        }

        // collectors next, bound to their writers
        for (id, component) in self.config.components(KIND_COLLECTORS) {
            if !component.enabled() {
                debug!(name = %id, "the collector {id} is disabled");
                continue;
            }
            let core = Arc::new(
                CollectorCore::from_config(&component)
                    .with_context(|| format!("cannot load component '{id}'"))?,
            );
            let writers = self.writers.clone();
            core.resolve_writers(&move |writer_id| {
                writers.iter().find(|w| w.id() == writer_id).cloned()
            });
            let class = component.class()?;
            let collector = match class.as_str() {
                "cron" => Collector::Cron(Arc::new(CronCollector::from_config(&component, core)?)),
                "event" => {
                    Collector::Event(Arc::new(EventCollector::from_config(&component, core)?))
                }
                other => anyhow::bail!(
                    "cannot load component '{id}': unknown collector class '{other}'"
                ),
            };
            self.collectors.push(collector);
        }

        // providers last; event collectors resolve their events now and
        // subscribe at start
        for (id, component) in self.config.components(KIND_PROVIDERS) {
            if !component.enabled() {
                debug!(name = %id, "the provider {id} is disabled");
                continue;
            }
            let class = component.class()?;
            let factory = self
                .provider_factories
                .get(&class)
                .with_context(|| format!("cannot load component '{id}': unknown provider class '{class}'"))?;
            let built = factory(&component, &self.config)
                .with_context(|| format!("cannot load component '{id}'"))?;
            self.providers.push(built);
        }

        let providers: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .map(|built| Arc::clone(&built.provider))
            .collect();
        for collector in &self.collectors {
            if let Collector::Event(event_collector) = collector {
                let providers = providers.clone();
                event_collector.resolve_sources(&move |provider_id| {
                    providers.iter().find(|p| p.id() == provider_id).cloned()
                });
            }
        }

        // the shared base scope: components by id, then custom functions
        let mut base: HashMap<String, ScopeValue> = HashMap::new();
        for built in &self.providers {
            base.insert(
                built.provider.id().to_string(),
                ScopeValue::Object(Arc::new(ProviderScopeObject(Arc::clone(&built.provider)))),
            );
        }
        for collector in &self.collectors {
            let core = Arc::clone(collector.core());
            base.insert(core.id().to_string(), ScopeValue::Object(core));
        }
        for (name, func) in &self.functions {
            base.insert(name.clone(), ScopeValue::Func(Arc::clone(func)));
        }
        let base = Arc::new(base);
        for collector in &self.collectors {
            collector.core().set_base_scope(Arc::clone(&base));
        }

        info!(
            "initialized {} writers, {} collectors, {} providers",
            self.writers.len(),
            self.collectors.len(),
            self.providers.len()
        );
        Ok(())
    }

    /// Starts every worker component.
    pub fn start(&mut self) {
        for writer in &self.writers {
            self.handles
                .push(Arc::clone(writer).start(self.shutdown.subscribe()));
        }
        for collector in &self.collectors {
            self.handles
                .push(collector.worker().start(self.shutdown.subscribe()));
        }
        for built in &self.providers {
            if let Some(worker) = &built.worker {
                self.handles
                    .push(Arc::clone(worker).start(self.shutdown.subscribe()));
            }
        }
    }

    /// Waits for every worker to exit.
    pub async fn join(&mut self) {
        let _ = futures_util::future::join_all(self.handles.drain(..)).await;
    }

    /// Releases component resources in reverse construction order.
    pub fn destroy(&self) {
        for built in self.providers.iter().rev() {
            built.provider.destroy();
        }
        for collector in self.collectors.iter().rev() {
            collector.core().destroy();
        }
        for writer in self.writers.iter().rev() {
            writer.destroy();
        }
        info!("destroyed all components");
    }
}
