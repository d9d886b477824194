//! Compilation of worker definitions into a [`RuntimeConfig`].
//!
//! [`ConfigCompiler::compile`] is a pure function of its input: it never
//! touches the file system or the network, and identical definitions always
//! produce byte-identical output. The supervisor relies on this to decide
//! whether a reconfiguration needs a restart.
//!
//! Checks run in a fixed order:
//!
//! 1. global invariants (`NoWorkers`, `DuplicateName`, `MultipleOutbounds`)
//! 2. shape validation, collected into a single [`ValidationError`]
//! 3. wrapped bindings: unknown targets, cycles, then per-binding invariants
//!
//! Rust handlers (inline outbound services, `node_custom` bindings, fetch
//! mocks and network permissions) can't be serialized into the engine
//! configuration. They are returned next to it in [`Compilation::handlers`],
//! keyed by the loopback service that serves them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};
use url::Url;

use edge_orchestrator_common::{
    BindingKind, BindingSpec, FetchMock, InlineHandler, OrchestratorError, OutboundService,
    ScriptSource, ValidationError, WorkerDefinition, WrappedReason,
};

use crate::compat::{self, DEFAULT_COMPATIBILITY_DATE};
use crate::graph::WrappedGraph;
use crate::routes::{RouteEntry, RoutePattern, sort_by_specificity};
use crate::runtime_config::{
    BindingConfig, CompiledBinding, LOCAL_HOST, PROXY_SERVICE, PROXY_SOCKET, RuntimeConfig,
    ServiceConfig, ServiceDesignator, ServiceKind, SocketConfig, WorkerConfig,
    binding_service_name, direct_socket_name, entry_socket_name, loopback_path,
    outbound_service_name, worker_service_name,
};

/// Hosts every unrestricted network service may reach.
const ANY_HOST: &str = "*";

const KNOWN_WORKER: &str = "name of a defined worker";

/// Settings that influence compilation but don't come from the definitions.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// `host:port` of the loopback server.
    pub loopback: Option<String>,
    /// Shared upstream base URL, used by workers without their own.
    pub upstream: Option<String>,
}

/// A Rust-side handler behind a loopback service.
#[derive(Debug, Clone)]
pub enum LoopbackHandler {
    /// A user-supplied handler.
    Custom(InlineHandler),
    /// Declarative mocked responses.
    FetchMock(FetchMock),
    /// Real network access restricted to some hosts.
    Network {
        /// Allowed host patterns.
        allowed_hosts: Vec<String>,
        /// Value of the `CF-Worker` header on outgoing requests.
        cf_worker: String,
    },
}

/// The result of a compilation.
#[derive(Debug, Clone)]
pub struct Compilation {
    /// Configuration handed to the engine.
    pub config: RuntimeConfig,
    /// Handlers served by the loopback server, keyed by service name.
    pub handlers: BTreeMap<String, LoopbackHandler>,
}

/// Compiles worker definitions.
#[derive(Debug, Clone, Default)]
pub struct ConfigCompiler {
    options: CompileOptions,
}

impl ConfigCompiler {
    /// Create a compiler.
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile definitions into the engine configuration.
    pub fn compile(&self, defs: &[WorkerDefinition]) -> Result<RuntimeConfig, OrchestratorError> {
        self.compile_all(defs).map(|compilation| compilation.config)
    }

    /// Compile definitions into the engine configuration and loopback handlers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error ([`OrchestratorError::is_config_error`])
    /// describing the first family of problems found. Nothing is compiled
    /// partially.
    pub fn compile_all(&self, defs: &[WorkerDefinition]) -> Result<Compilation, OrchestratorError> {
        check_global(defs)?;
        self.validate(defs)?;
        let wrapped_only = check_wrapped(defs)?;

        let compilation = self.assemble(defs, &wrapped_only);
        debug!(
            workers = compilation.config.workers.len(),
            services = compilation.config.services.len(),
            sockets = compilation.config.sockets.len(),
            routes = compilation.config.routes.len(),
            "Compiled runtime configuration"
        );
        Ok(compilation)
    }

    fn validate(&self, defs: &[WorkerDefinition]) -> Result<(), OrchestratorError> {
        let names: HashSet<&str> = defs.iter().map(WorkerDefinition::name).collect();
        let mut issues = ValidationError::default();

        if let Some(upstream) = &self.options.upstream {
            validate_upstream(&mut issues, "proxy.upstream", upstream);
        }

        for (i, def) in defs.iter().enumerate() {
            let at = format!("workers[{i}]");
            validate_script(&mut issues, &at, &def.script);

            if let Some(date) = &def.compatibility_date {
                if !compat::is_valid_date(date) {
                    issues.push(
                        format!("{at}.compatibility_date"),
                        "YYYY-MM-DD date",
                        quoted(date),
                    );
                }
            }

            for (j, route) in def.routes.iter().enumerate() {
                if let Err(err) = RoutePattern::parse(route) {
                    issues.push(
                        format!("{at}.routes[{j}]"),
                        format!("route pattern [scheme://]host[/path] ({})", err.reason),
                        quoted(route),
                    );
                }
            }

            validate_bindings(&mut issues, &at, &def.bindings, &names);

            for (j, tail) in def.tails.iter().enumerate() {
                if !names.contains(tail.name.as_str()) {
                    issues.push(format!("{at}.tails[{j}].name"), KNOWN_WORKER, quoted(&tail.name));
                }
            }

            if let Some(OutboundService::Worker(target)) = &def.outbound_service {
                if !names.contains(target.name.as_str()) {
                    issues.push(
                        format!("{at}.outbound_service.name"),
                        KNOWN_WORKER,
                        quoted(&target.name),
                    );
                }
            }

            if let Some(upstream) = &def.upstream {
                validate_upstream(&mut issues, &format!("{at}.upstream"), upstream);
            }

            let mut entrypoints = HashSet::new();
            for (j, socket) in def.unsafe_direct_sockets.iter().enumerate() {
                if !entrypoints.insert(socket.entrypoint.as_deref()) {
                    issues.push(
                        format!("{at}.unsafe_direct_sockets[{j}].entrypoint"),
                        "at most one direct socket per entrypoint",
                        quoted(socket.entrypoint.as_deref().unwrap_or("default")),
                    );
                }
            }
        }

        issues.into_result()
    }

    fn assemble(&self, defs: &[WorkerDefinition], wrapped_only: &BTreeSet<String>) -> Compilation {
        let mut services = vec![ServiceConfig {
            name: PROXY_SERVICE.to_string(),
            kind: ServiceKind::Proxy,
        }];
        let mut sockets = vec![SocketConfig {
            name: PROXY_SOCKET.to_string(),
            host: LOCAL_HOST.to_string(),
            port: 0,
            service: ServiceDesignator::new(PROXY_SERVICE),
        }];
        let mut handlers = BTreeMap::new();
        let mut routes = Vec::new();
        let mut upstreams = BTreeMap::new();
        let mut workers = Vec::new();

        for def in defs {
            let name = def.name();
            let cf_worker = cf_worker_name(def);

            // Wrapped implementations still need the services their bindings use
            binding_services(def, &cf_worker, &mut services, &mut handlers);

            if wrapped_only.contains(name) {
                if !def.routes.is_empty() || !def.unsafe_direct_sockets.is_empty() {
                    warn!(
                        worker = %name,
                        "Ignoring routes and direct sockets of a wrapped binding implementation"
                    );
                }
                continue;
            }

            let date = def
                .compatibility_date
                .clone()
                .unwrap_or_else(|| DEFAULT_COMPATIBILITY_DATE.to_string());
            let flags = compat::resolve_flags(&date, &def.compatibility_flags);

            let global_outbound = outbound(def, cf_worker.clone(), &mut services, &mut handlers);
            let bindings = compile_bindings(defs, def, &date, &flags);
            let tails = def
                .tails
                .iter()
                .map(|tail| {
                    ServiceDesignator::with_entrypoint(
                        worker_service_name(&tail.name),
                        tail.entrypoint.clone(),
                    )
                })
                .collect();

            services.push(ServiceConfig {
                name: worker_service_name(name),
                kind: ServiceKind::Worker(WorkerConfig {
                    name: name.to_string(),
                    script: def.script.clone(),
                    compatibility_date: date,
                    compatibility_flags: flags,
                    bindings,
                    global_outbound,
                    tails,
                    cf_worker,
                }),
            });

            sockets.push(SocketConfig {
                name: entry_socket_name(name),
                host: LOCAL_HOST.to_string(),
                port: 0,
                service: ServiceDesignator::new(worker_service_name(name)),
            });
            for socket in &def.unsafe_direct_sockets {
                sockets.push(SocketConfig {
                    name: direct_socket_name(name, socket.entrypoint.as_deref()),
                    host: socket.host.clone().unwrap_or_else(|| LOCAL_HOST.to_string()),
                    port: socket.port.unwrap_or(0),
                    service: ServiceDesignator::with_entrypoint(
                        worker_service_name(name),
                        socket.entrypoint.clone(),
                    ),
                });
            }

            routes.extend(
                def.routes
                    .iter()
                    .filter_map(|route| RoutePattern::parse(route).ok())
                    .map(|pattern| RouteEntry {
                        pattern,
                        worker: name.to_string(),
                    }),
            );

            if let Some(upstream) = def.upstream.as_ref().or(self.options.upstream.as_ref()) {
                upstreams.insert(name.to_string(), upstream.clone());
            }

            workers.push(name.to_string());
        }

        sort_by_specificity(&mut routes);
        services.sort_by(|a, b| a.name.cmp(&b.name));
        sockets.sort_by(|a, b| a.name.cmp(&b.name));

        Compilation {
            config: RuntimeConfig {
                entrypoint: defs.first().map(|def| def.name().to_string()).unwrap_or_default(),
                workers,
                services,
                sockets,
                routes,
                upstreams,
                wrapped_only: wrapped_only.iter().cloned().collect(),
                loopback: self.options.loopback.clone(),
            },
            handlers,
        }
    }
}

fn check_global(defs: &[WorkerDefinition]) -> Result<(), OrchestratorError> {
    if defs.is_empty() {
        return Err(OrchestratorError::NoWorkers);
    }

    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.name()) {
            return Err(OrchestratorError::DuplicateName {
                name: def.name().to_string(),
            });
        }
    }

    if let Some(def) = defs
        .iter()
        .find(|def| def.outbound_service.is_some() && def.fetch_mock.is_some())
    {
        return Err(OrchestratorError::MultipleOutbounds {
            worker: def.name().to_string(),
        });
    }

    Ok(())
}

fn validate_script(issues: &mut ValidationError, at: &str, script: &ScriptSource) {
    match script {
        ScriptSource::Script { code, path } => {
            if code.is_some() == path.is_some() {
                let received = if code.is_some() { "both" } else { "neither" };
                issues.push(format!("{at}.script"), "exactly one of `code` or `path`", received);
            }
        }
        ScriptSource::Modules { modules } => {
            if modules.is_empty() {
                issues.push(format!("{at}.script.modules"), "at least one module", "[]");
            }
            let mut seen = HashSet::new();
            for (k, module) in modules.iter().enumerate() {
                let at = format!("{at}.script.modules[{k}]");
                if !seen.insert(module.name.as_str()) {
                    issues.push(format!("{at}.name"), "unique module name", quoted(&module.name));
                }
                if module.contents.is_some() == module.path.is_some() {
                    let received = if module.path.is_some() { "both" } else { "neither" };
                    issues.push(at, "exactly one of `contents` or `path`", received);
                }
            }
        }
    }
}

fn validate_bindings(
    issues: &mut ValidationError,
    at: &str,
    bindings: &[BindingSpec],
    names: &HashSet<&str>,
) {
    let mut seen = HashSet::new();
    for (j, binding) in bindings.iter().enumerate() {
        let at = format!("{at}.bindings[{j}]");
        if !seen.insert(binding.name.as_str()) {
            issues.push(
                format!("{at}.name"),
                "binding name unique within the worker",
                quoted(&binding.name),
            );
        }

        match &binding.kind {
            BindingKind::Service { target, .. } if !names.contains(target.as_str()) => {
                issues.push(format!("{at}.target"), KNOWN_WORKER, quoted(target));
            }
            BindingKind::DurableObject {
                script_name: Some(script_name),
                ..
            } if !names.contains(script_name.as_str()) => {
                issues.push(format!("{at}.script_name"), KNOWN_WORKER, quoted(script_name));
            }
            BindingKind::External { scheme, .. } if scheme != "http" && scheme != "https" => {
                issues.push(format!("{at}.scheme"), "\"http\" or \"https\"", quoted(scheme));
            }
            BindingKind::NodeCustom { handler: None } => {
                issues.push(format!("{at}.handler"), "inline handler", "nothing");
            }
            _ => {}
        }
    }
}

fn validate_upstream(issues: &mut ValidationError, at: &str, upstream: &str) {
    let valid = Url::parse(upstream)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false);
    if !valid {
        issues.push(at, "absolute http(s) URL", quoted(upstream));
    }
}

/// Check wrapped bindings; returns the names of workers that only implement
/// wrapped bindings.
fn check_wrapped(defs: &[WorkerDefinition]) -> Result<BTreeSet<String>, OrchestratorError> {
    let index: HashMap<&str, usize> = defs
        .iter()
        .enumerate()
        .map(|(i, def)| (def.name(), i))
        .collect();

    // Workers addressed as services can't double as wrapped implementations
    let mut referenced: HashSet<&str> = HashSet::new();
    for def in defs {
        for binding in &def.bindings {
            match &binding.kind {
                BindingKind::Service { target, .. } => {
                    referenced.insert(target);
                }
                BindingKind::DurableObject {
                    script_name: Some(script_name),
                    ..
                } => {
                    referenced.insert(script_name);
                }
                _ => {}
            }
        }
        referenced.extend(def.tails.iter().map(|tail| tail.name.as_str()));
        if let Some(OutboundService::Worker(target)) = &def.outbound_service {
            referenced.insert(&target.name);
        }
    }

    let mut graph = WrappedGraph::new(defs.iter().map(WorkerDefinition::name));
    let mut wrapped = Vec::new();
    for def in defs {
        for binding in &def.bindings {
            if let BindingKind::Wrapped { script_name, .. } = &binding.kind {
                let Some(&target) = index.get(script_name.as_str()) else {
                    return Err(invalid_wrapped(def, binding, script_name, WrappedReason::UnknownTarget));
                };
                graph.add_edge(def.name(), script_name);
                wrapped.push((def, binding, target));
            }
        }
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(OrchestratorError::Cyclic { cycle });
    }

    let mut wrapped_only = BTreeSet::new();
    for (def, binding, target) in wrapped {
        let target_def = &defs[target];
        let target_name = target_def.name();

        let reason = if target == 0 {
            Some(WrappedReason::IsEntrypoint)
        } else if !target_def.is_modules() {
            Some(WrappedReason::NotModules)
        } else if referenced.contains(target_name) {
            Some(WrappedReason::ReferencedByService)
        } else if target_def.has_own_settings() {
            Some(WrappedReason::OwnSettings)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(invalid_wrapped(def, binding, target_name, reason));
        }

        wrapped_only.insert(target_name.to_string());
    }

    Ok(wrapped_only)
}

fn invalid_wrapped(
    def: &WorkerDefinition,
    binding: &BindingSpec,
    target: &str,
    reason: WrappedReason,
) -> OrchestratorError {
    OrchestratorError::InvalidWrapped {
        binding: binding.name.clone(),
        worker: def.name().to_string(),
        target: target.to_string(),
        reason,
    }
}

/// Register services for bindings that need one of their own.
fn binding_services(
    def: &WorkerDefinition,
    cf_worker: &str,
    services: &mut Vec<ServiceConfig>,
    handlers: &mut BTreeMap<String, LoopbackHandler>,
) {
    for binding in &def.bindings {
        let name = binding_service_name(def.name(), &binding.name);
        let kind = match &binding.kind {
            BindingKind::External { address, scheme } => ServiceKind::External {
                address: address.clone(),
                scheme: scheme.clone(),
            },
            BindingKind::Disk { path, writable } => ServiceKind::Disk {
                path: path.clone(),
                writable: *writable,
            },
            BindingKind::Network { allowed_hosts } => {
                handlers.insert(
                    name.clone(),
                    LoopbackHandler::Network {
                        allowed_hosts: allowed_hosts.clone(),
                        cf_worker: cf_worker.to_string(),
                    },
                );
                ServiceKind::Loopback {
                    path: loopback_path(&name),
                }
            }
            BindingKind::NodeCustom {
                handler: Some(handler),
            } => {
                handlers.insert(name.clone(), LoopbackHandler::Custom(handler.clone()));
                ServiceKind::Loopback {
                    path: loopback_path(&name),
                }
            }
            _ => continue,
        };
        services.push(ServiceConfig { name, kind });
    }
}

/// Resolve where a worker's outbound `fetch()` calls go.
fn outbound(
    def: &WorkerDefinition,
    cf_worker: String,
    services: &mut Vec<ServiceConfig>,
    handlers: &mut BTreeMap<String, LoopbackHandler>,
) -> ServiceDesignator {
    let handler = match (&def.outbound_service, &def.fetch_mock) {
        (Some(OutboundService::Worker(target)), _) => {
            return ServiceDesignator::with_entrypoint(
                worker_service_name(&target.name),
                target.entrypoint.clone(),
            );
        }
        (Some(OutboundService::Inline(handler)), _) => LoopbackHandler::Custom(handler.clone()),
        (None, Some(mock)) => LoopbackHandler::FetchMock(mock.clone()),
        (None, None) => LoopbackHandler::Network {
            allowed_hosts: vec![ANY_HOST.to_string()],
            cf_worker,
        },
    };

    let name = outbound_service_name(def.name());
    handlers.insert(name.clone(), handler);
    services.push(ServiceConfig {
        name: name.clone(),
        kind: ServiceKind::Loopback {
            path: loopback_path(&name),
        },
    });
    ServiceDesignator::new(name)
}

fn compile_bindings(
    defs: &[WorkerDefinition],
    def: &WorkerDefinition,
    date: &str,
    flags: &[String],
) -> Vec<BindingConfig> {
    def.bindings
        .iter()
        .map(|binding| BindingConfig {
            name: binding.name.clone(),
            kind: compile_binding(defs, def.name(), binding, date, flags),
        })
        .collect()
}

fn compile_binding(
    defs: &[WorkerDefinition],
    worker: &str,
    binding: &BindingSpec,
    date: &str,
    flags: &[String],
) -> CompiledBinding {
    let or_binding_name = |value: &Option<String>| value.clone().unwrap_or_else(|| binding.name.clone());

    match &binding.kind {
        BindingKind::Service { target, entrypoint } => CompiledBinding::Service(
            ServiceDesignator::with_entrypoint(worker_service_name(target), entrypoint.clone()),
        ),
        BindingKind::Wrapped {
            script_name,
            entrypoint,
            inner_bindings,
        } => {
            // The wrapped graph is acyclic here, so this recursion terminates
            let implementation = defs.iter().find(|def| def.name() == script_name);
            CompiledBinding::Wrapped {
                implementation: script_name.clone(),
                modules: implementation.map(|def| def.script.clone()).unwrap_or_default(),
                entrypoint: entrypoint.clone(),
                inner_bindings: inner_bindings.clone(),
                bindings: implementation
                    .map(|def| compile_bindings(defs, def, date, flags))
                    .unwrap_or_default(),
                compatibility_date: date.to_string(),
                compatibility_flags: flags.to_vec(),
            }
        }
        BindingKind::Network { .. }
        | BindingKind::External { .. }
        | BindingKind::Disk { .. }
        | BindingKind::NodeCustom { .. } => CompiledBinding::Service(ServiceDesignator::new(
            binding_service_name(worker, &binding.name),
        )),
        BindingKind::KvNamespace { id } => CompiledBinding::KvNamespace {
            id: or_binding_name(id),
        },
        BindingKind::DurableObject {
            script_name,
            class_name,
        } => CompiledBinding::DurableObject {
            service: worker_service_name(script_name.as_deref().unwrap_or(worker)),
            class_name: class_name.clone(),
        },
        BindingKind::QueueProducer { queue } => CompiledBinding::QueueProducer {
            queue: or_binding_name(queue),
        },
        BindingKind::R2Bucket { bucket } => CompiledBinding::R2Bucket {
            bucket: or_binding_name(bucket),
        },
        BindingKind::D1Database { id } => CompiledBinding::D1Database {
            id: or_binding_name(id),
        },
        BindingKind::PlainValue { value } => CompiledBinding::Json {
            value: value.clone(),
        },
        BindingKind::TextBlob { path } => CompiledBinding::Text { path: path.clone() },
        BindingKind::DataBlob { path } => CompiledBinding::Data { path: path.clone() },
        BindingKind::WasmModule { path } => CompiledBinding::WasmModule { path: path.clone() },
    }
}

/// Value of the `CF-Worker` header for a worker's outgoing requests.
pub fn cf_worker_name(def: &WorkerDefinition) -> String {
    match (&def.zone, def.name()) {
        (Some(zone), _) => zone.clone(),
        (None, "") => "worker.example.com".to_string(),
        (None, name) => format!("{name}.example.com"),
    }
}

fn quoted(value: &str) -> String {
    format!("{value:?}")
}
