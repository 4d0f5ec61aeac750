//! `(algorithm, method, tier) → kernel` registry.
//!
//! The process-wide registry is filled lazily: the first resolution for an
//! algorithm calls its [`Algorithm::register_kernels`] exactly once.
//! Resolution walks down from the requested tier and returns the first
//! registered kernel, so every algorithm needs at least a baseline kernel.
//!
//! Standalone registries (for tests or custom kernels) are created with
//! [`KernelRegistry::new`] and filled explicitly.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::algorithm::{Algorithm, Kernel, Method};
use super::cpu::CpuTier;
use crate::error::ComputeError;

type KernelKey = (TypeId, &'static str, CpuTier);

/// Shared kernel handle.
pub type KernelHandle<A> = Arc<dyn Kernel<A>>;

/// Kernel lookup table.
#[derive(Default)]
pub struct KernelRegistry {
    // Values are `KernelHandle<A>` for the algorithm named by the key.
    kernels: HashMap<KernelKey, Box<dyn Any + Send + Sync>>,
    registered: HashSet<TypeId>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.kernels.len())
            .field("algorithms", &self.registered.len())
            .finish()
    }
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every kernel of `A`.
    pub fn with_algorithm<A: Algorithm>() -> Self {
        let mut registry = Self::new();
        registry.ensure_registered::<A>();
        registry
    }

    /// Register `kernel` for `(A, method, tier)`, replacing any previous one.
    pub fn register<A: Algorithm>(
        &mut self,
        method: A::Method,
        tier: CpuTier,
        kernel: impl Kernel<A> + 'static,
    ) {
        let handle: KernelHandle<A> = Arc::new(kernel);
        self.kernels
            .insert((TypeId::of::<A>(), method.name(), tier), Box::new(handle));
    }

    /// Whether a kernel is registered at exactly `tier`.
    pub fn contains<A: Algorithm>(&self, method: A::Method, tier: CpuTier) -> bool {
        self.kernels
            .contains_key(&(TypeId::of::<A>(), method.name(), tier))
    }

    /// Tiers with a registered kernel, narrowest first.
    pub fn tiers<A: Algorithm>(&self, method: A::Method) -> Vec<CpuTier> {
        CpuTier::ALL
            .into_iter()
            .filter(|&t| self.contains::<A>(method, t))
            .collect()
    }

    /// Run `A::register_kernels` unless it already ran on this registry.
    pub fn ensure_registered<A: Algorithm>(&mut self) {
        if self.registered.insert(TypeId::of::<A>()) {
            A::register_kernels(self);
            log::debug!("registered kernels for {}", A::NAME);
        }
    }

    fn is_registered<A: Algorithm>(&self) -> bool {
        self.registered.contains(&TypeId::of::<A>())
    }

    /// Kernel for `(A, method)` at the highest registered tier `<= tier`.
    ///
    /// Returns the tier actually resolved. Fails with
    /// [`ComputeError::Unsupported`] if nothing is registered down to
    /// baseline.
    pub fn lookup<A: Algorithm>(
        &self,
        method: A::Method,
        tier: CpuTier,
    ) -> Result<(CpuTier, KernelHandle<A>), ComputeError> {
        let mut current = Some(tier);
        while let Some(t) = current {
            let handle = self
                .kernels
                .get(&(TypeId::of::<A>(), method.name(), t))
                .and_then(|k| k.downcast_ref::<KernelHandle<A>>());
            if let Some(handle) = handle {
                if t != tier {
                    log::debug!(
                        "{} [{}]: no {tier} kernel, using {t}",
                        A::NAME,
                        method.name()
                    );
                }
                return Ok((t, Arc::clone(handle)));
            }
            current = t.lower();
        }
        Err(ComputeError::unsupported(format!(
            "no kernel registered for {} method `{}`",
            A::NAME,
            method.name()
        )))
    }
}

static GLOBAL: OnceLock<RwLock<KernelRegistry>> = OnceLock::new();

fn global() -> &'static RwLock<KernelRegistry> {
    GLOBAL.get_or_init(|| RwLock::new(KernelRegistry::new()))
}

/// Resolve from the process-wide registry, registering `A` on first use.
pub fn resolve<A: Algorithm>(
    method: A::Method,
    tier: CpuTier,
) -> Result<(CpuTier, KernelHandle<A>), ComputeError> {
    {
        let registry = global().read();
        if registry.is_registered::<A>() {
            return registry.lookup::<A>(method, tier);
        }
    }
    let mut registry = global().write();
    registry.ensure_registered::<A>();
    registry.lookup::<A>(method, tier)
}

/// Resolve from `custom` if given, else from the process-wide registry.
pub(crate) fn resolve_in<A: Algorithm>(
    custom: Option<&KernelRegistry>,
    method: A::Method,
    tier: CpuTier,
) -> Result<(CpuTier, KernelHandle<A>), ComputeError> {
    match custom {
        Some(registry) => registry.lookup::<A>(method, tier),
        None => resolve::<A>(method, tier),
    }
}
