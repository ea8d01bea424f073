//! Shared fixtures: a counter service hosted on a loopback network.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use remrun::dispatch::Call;
use remrun::dispatch::MethodDispatcher;
use remrun::events::ClientObserver;
use remrun::events::NoopObserver;
use remrun::exceptions::ArgumentError;
use remrun::exceptions::OperationCanceled;
use remrun::host::ServiceHost;
use remrun::local::LoopbackNetwork;
use remrun::local::StaticResolver;
use remrun::marshal::ExceptionPipeline;
use remrun::partition::PartitionClient;
use remrun::partition::PartitionTarget;
use remrun::proxy::ProxyFactory;
use remrun::proxy::ServiceProxy;
use remrun::registry::InterfaceDescriptor;
use remrun::resolver::PartitionKey;
use remrun::resolver::PartitionLocation;
use remrun::BoxError;
use remrun::InterfaceDefinition;
use remrun::InterfaceRegistry;
use remrun::MethodDefinition;
use remrun::RemotedInterface;
use remrun::RemotingConfig;

pub const SERVICE_URI: &str = "fabric:/demo/counter";
pub const ADDRESS: &str = "loopback://node-1";
pub const OTHER_ADDRESS: &str = "loopback://node-2";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Base interface every counter also serves.
pub struct Named;

impl RemotedInterface for Named {
    fn definition() -> InterfaceDefinition {
        InterfaceDefinition::new("Demo.INamed").method(MethodDefinition::new("Name").returns::<String>())
    }
}

pub struct Counter;

impl RemotedInterface for Counter {
    fn definition() -> InterfaceDefinition {
        InterfaceDefinition::new("Demo.ICounter")
            .with_id(42)
            .extends(Named::definition())
            .method(MethodDefinition::new("Increment").with_id(1).param::<i64>().returns::<i64>())
            .method(MethodDefinition::new("Fail").param::<String>())
            .method(MethodDefinition::new("Wait").param::<u64>().returns::<u64>().cancellable())
            .method(MethodDefinition::new("Slow").param::<u64>().returns::<u64>().cancellable())
            .method(MethodDefinition::new("Hang").returns::<u64>().cancellable())
            .method(MethodDefinition::new("WhoAmI").returns::<String>())
            .method(MethodDefinition::new("Record").param::<String>())
    }
}

#[derive(Default)]
pub struct CounterImpl {
    pub increments: AtomicUsize,
    pub waits: AtomicUsize,
    pub wait_cancelled: AtomicBool,
    pub records: Mutex<Vec<String>>,
    pub recorded: Notify,
}

pub fn counter_dispatcher(descriptor: Arc<InterfaceDescriptor>) -> MethodDispatcher<CounterImpl> {
    MethodDispatcher::<CounterImpl>::builder(descriptor)
        .method("Increment", |c: Arc<CounterImpl>, n: i64, _call: Call| async move {
            c.increments.fetch_add(1, Ordering::SeqCst);
            Ok::<i64, BoxError>(n + 1)
        })
        .method("Fail", |_c: Arc<CounterImpl>, message: String, _call: Call| async move {
            Err::<(), BoxError>(Box::new(ArgumentError::new(message)))
        })
        .method("Wait", |c: Arc<CounterImpl>, ms: u64, call: Call| async move {
            c.waits.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = call.token.cancelled() => {
                    c.wait_cancelled.store(true, Ordering::SeqCst);
                    Err::<u64, BoxError>(Box::new(OperationCanceled::new("wait cancelled")))
                }
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ms),
            }
        })
        .method("Slow", |_c: Arc<CounterImpl>, ms: u64, _call: Call| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<u64, BoxError>(ms)
        })
        .method("Hang", |_c: Arc<CounterImpl>, (): (), _call: Call| async move {
            futures::future::pending::<()>().await;
            Ok::<u64, BoxError>(0)
        })
        .method("WhoAmI", |_c: Arc<CounterImpl>, (): (), call: Call| async move {
            Ok::<String, BoxError>(call.request_id().to_string())
        })
        .method("Record", |c: Arc<CounterImpl>, entry: String, _call: Call| async move {
            c.records.lock().unwrap().push(entry);
            c.recorded.notify_one();
            Ok::<(), BoxError>(())
        })
        .build()
        .expect("counter dispatcher")
}

pub fn named_dispatcher(descriptor: Arc<InterfaceDescriptor>) -> MethodDispatcher<CounterImpl> {
    MethodDispatcher::<CounterImpl>::builder(descriptor)
        .method("Name", |_c: Arc<CounterImpl>, (): (), _call: Call| async move {
            Ok::<String, BoxError>("counter".to_string())
        })
        .build()
        .expect("named dispatcher")
}

pub fn location(partition_id: &str, address: &str) -> PartitionLocation {
    PartitionLocation::new(SERVICE_URI, partition_id).with_endpoint("", address)
}

pub fn host(config: &RemotingConfig, registry: &InterfaceRegistry, counter: Arc<CounterImpl>) -> Arc<ServiceHost> {
    let descriptor = registry.register::<Counter>().expect("register counter");
    let named = registry.register::<Named>().expect("register named");

    let host = ServiceHost::new(ExceptionPipeline::new(config.exceptions.clone()));
    host.add_service(counter_dispatcher(descriptor).bind(counter.clone()))
        .expect("host counter");
    host.add_service(named_dispatcher(named).bind(counter))
        .expect("host named");
    Arc::new(host)
}

/// A client, a resolver and one hosted counter, all in process.
pub struct Harness {
    pub config: RemotingConfig,
    pub registry: Arc<InterfaceRegistry>,
    pub network: LoopbackNetwork,
    pub resolver: Arc<StaticResolver>,
    pub counter: Arc<CounterImpl>,
    pub host: Arc<ServiceHost>,
    pub client: Arc<PartitionClient>,
    pub factory: ProxyFactory,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RemotingConfig::default())
    }

    pub fn with_config(config: RemotingConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: RemotingConfig, observer: Arc<dyn ClientObserver>) -> Self {
        init_tracing();
        let registry = Arc::new(InterfaceRegistry::new());
        let counter = Arc::new(CounterImpl::default());
        let host = host(&config, &registry, counter.clone());

        let network = LoopbackNetwork::new();
        network.bind(ADDRESS, host.clone());

        let resolver = Arc::new(StaticResolver::new());
        resolver.set_location(SERVICE_URI, PartitionKey::Singleton, location("p0", ADDRESS));

        let client = Arc::new(
            PartitionClient::new(resolver.clone(), Arc::new(network.clone()), config.partition.clone())
                .with_observer(observer),
        );
        let factory = ProxyFactory::new(registry.clone(), client.clone(), &config);

        Self {
            config,
            registry,
            network,
            resolver,
            counter,
            host,
            client,
            factory,
        }
    }

    /// Brings up a second counter host at [`OTHER_ADDRESS`].
    pub fn second_host(&self) -> Arc<CounterImpl> {
        let counter = Arc::new(CounterImpl::default());
        let host = host(&self.config, &self.registry, counter.clone());
        self.network.bind(OTHER_ADDRESS, host);
        counter
    }

    pub fn proxy(&self) -> ServiceProxy {
        self.factory
            .create::<Counter>(PartitionTarget::new(SERVICE_URI))
            .expect("counter proxy")
    }
}
