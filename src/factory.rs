//! Factory / Defaults (spec.md §6): the complete recognized configuration
//! surface for constructing a [`FunctionTree`], builder-style, following the
//! validate-on-build shape of the teacher's `message_router::config`.

use crate::container::DistributedContainer;
use crate::numerics::NumericsContext;
use crate::process_map::{ProcessMap, SingleProcessMap};
use crate::rml::Rml;
use crate::runtime::TaskRuntime;
use crate::tensor::DenseTensor;
use crate::transport::Transport;
use crate::tree::bc::BcMatrix;
use crate::tree::{FunctionTree, Mode, TruncateMode};
use std::sync::Arc;
use thiserror::Error;

/// The upper bound on wavelet order the two-scale/quadrature tables support
/// (spec.md §2's "for each wavelet order `k ∈ [1, KMAX]`").
pub const KMAX: usize = 30;

/// Bad construction-time configuration (spec.md §7's "bad configuration at
/// construction" surface, reported before any tree is touched).
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("wavelet order k={k} out of range [1, {KMAX}]")]
    KOutOfRange { k: usize },

    #[error("thresh must be positive, got {thresh}")]
    NonPositiveThresh { thresh: f64 },

    #[error("max_refine_level ({max_refine_level}) must be >= initial_level ({initial_level})")]
    RefineLevelTooLow {
        initial_level: u32,
        max_refine_level: u32,
    },

    #[error("a functor is required unless `empty` is set")]
    MissingFunctor,
}

/// Builder for [`FunctionTree`] construction options, covering the complete
/// recognized set from spec.md §6. Defaults match the source's defaults:
/// `k=6`, `thresh=1e-6`, zero boundary conditions, no autorefinement.
pub struct TreeFactory<const D: usize> {
    k: usize,
    thresh: f64,
    initial_level: u32,
    max_refine_level: u32,
    truncate_mode: TruncateMode,
    refine: bool,
    empty: bool,
    autorefine: bool,
    truncate_on_project: bool,
    fence: bool,
    bc: BcMatrix<D>,
    pmap: Arc<dyn ProcessMap<D>>,
    functor: Option<Arc<dyn Fn(&[f64; D]) -> f64 + Send + Sync>>,
}

impl<const D: usize> Default for TreeFactory<D> {
    fn default() -> Self {
        Self {
            k: 6,
            thresh: 1e-6,
            initial_level: 2,
            max_refine_level: 30,
            truncate_mode: TruncateMode::Plain,
            refine: true,
            empty: false,
            autorefine: false,
            truncate_on_project: false,
            fence: true,
            bc: BcMatrix::all_zero(),
            pmap: Arc::new(SingleProcessMap),
            functor: None,
        }
    }
}

impl<const D: usize> TreeFactory<D> {
    /// A factory seeded with the defaults above.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    #[must_use]
    pub fn with_thresh(mut self, thresh: f64) -> Self {
        self.thresh = thresh;
        self
    }

    #[must_use]
    pub fn with_initial_level(mut self, initial_level: u32) -> Self {
        self.initial_level = initial_level;
        self
    }

    #[must_use]
    pub fn with_max_refine_level(mut self, max_refine_level: u32) -> Self {
        self.max_refine_level = max_refine_level;
        self
    }

    #[must_use]
    pub fn with_truncate_mode(mut self, truncate_mode: TruncateMode) -> Self {
        self.truncate_mode = truncate_mode;
        self
    }

    #[must_use]
    pub fn with_refine(mut self, refine: bool) -> Self {
        self.refine = refine;
        self
    }

    #[must_use]
    pub fn with_empty(mut self, empty: bool) -> Self {
        self.empty = empty;
        self
    }

    #[must_use]
    pub fn with_autorefine(mut self, autorefine: bool) -> Self {
        self.autorefine = autorefine;
        self
    }

    #[must_use]
    pub fn with_truncate_on_project(mut self, truncate_on_project: bool) -> Self {
        self.truncate_on_project = truncate_on_project;
        self
    }

    #[must_use]
    pub fn with_fence(mut self, fence: bool) -> Self {
        self.fence = fence;
        self
    }

    #[must_use]
    pub fn with_bc(mut self, bc: BcMatrix<D>) -> Self {
        self.bc = bc;
        self
    }

    #[must_use]
    pub fn with_pmap(mut self, pmap: Arc<dyn ProcessMap<D>>) -> Self {
        self.pmap = pmap;
        self
    }

    #[must_use]
    pub fn with_functor(mut self, functor: Arc<dyn Fn(&[f64; D]) -> f64 + Send + Sync>) -> Self {
        self.functor = Some(functor);
        self
    }

    /// Check the option set for internal consistency, independent of any
    /// runtime handles (spec.md §7: bad configuration is reported before
    /// construction touches the container/transport).
    ///
    /// # Errors
    /// Returns [`FactoryError`] for an out-of-range `k`, a non-positive
    /// `thresh`, `max_refine_level < initial_level`, or a missing functor
    /// when `empty` is not set.
    pub fn validate(&self) -> Result<(), FactoryError> {
        if self.k == 0 || self.k > KMAX {
            return Err(FactoryError::KOutOfRange { k: self.k });
        }
        if self.thresh <= 0.0 {
            return Err(FactoryError::NonPositiveThresh {
                thresh: self.thresh,
            });
        }
        if self.max_refine_level < self.initial_level {
            return Err(FactoryError::RefineLevelTooLow {
                initial_level: self.initial_level,
                max_refine_level: self.max_refine_level,
            });
        }
        if !self.empty && self.functor.is_none() {
            return Err(FactoryError::MissingFunctor);
        }
        Ok(())
    }

    /// Build the (initially empty, unprojected) tree and its infrastructure
    /// handles, validating the option set first. Projection, if a functor
    /// was supplied and `empty` is false, is the caller's next step via
    /// `tree::algorithms::project` — the factory hands back a tree ready
    /// for it, plus the functor so the caller doesn't have to thread it
    /// through separately.
    ///
    /// # Errors
    /// Returns [`FactoryError`] if `validate` fails.
    pub fn build(
        self,
        rml: Arc<Rml>,
        runtime: TaskRuntime,
        transport: Arc<dyn Transport>,
    ) -> Result<
        (
            FunctionTree<DenseTensor, D>,
            Option<Arc<dyn Fn(&[f64; D]) -> f64 + Send + Sync>>,
            bool,
            u32,
        ),
        FactoryError,
    > {
        self.validate()?;
        let container = DistributedContainer::new(rml.clone(), runtime.clone(), self.pmap.clone());
        let tree = FunctionTree {
            container,
            k: self.k,
            thresh: self.thresh,
            bc: self.bc,
            truncate_mode: self.truncate_mode,
            max_refine_level: self.max_refine_level,
            autorefine: self.autorefine,
            truncate_on_project: self.truncate_on_project,
            mode: Mode::Reconstructed,
            numerics: Arc::new(NumericsContext::new()),
            pmap: self.pmap,
            runtime,
            rml,
            transport,
        };
        Ok((tree, self.functor, self.refine, self.initial_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_factory_validates() {
        let factory: TreeFactory<2> = TreeFactory::new().with_empty(true);
        assert!(factory.validate().is_ok());
    }

    #[test]
    fn rejects_k_out_of_range() {
        let factory: TreeFactory<2> = TreeFactory::new().with_empty(true).with_k(0);
        assert!(matches!(
            factory.validate(),
            Err(FactoryError::KOutOfRange { k: 0 })
        ));
    }

    #[test]
    fn rejects_non_positive_thresh() {
        let factory: TreeFactory<2> = TreeFactory::new().with_empty(true).with_thresh(0.0);
        assert!(matches!(
            factory.validate(),
            Err(FactoryError::NonPositiveThresh { .. })
        ));
    }

    #[test]
    fn rejects_refine_level_below_initial() {
        let factory: TreeFactory<2> = TreeFactory::new()
            .with_empty(true)
            .with_initial_level(5)
            .with_max_refine_level(2);
        assert!(matches!(
            factory.validate(),
            Err(FactoryError::RefineLevelTooLow { .. })
        ));
    }

    #[test]
    fn rejects_missing_functor_when_not_empty() {
        let factory: TreeFactory<2> = TreeFactory::new();
        assert!(matches!(
            factory.validate(),
            Err(FactoryError::MissingFunctor)
        ));
    }

    #[test]
    fn accepts_functor_without_empty() {
        let factory: TreeFactory<2> =
            TreeFactory::new().with_functor(Arc::new(|x: &[f64; 2]| x[0] + x[1]));
        assert!(factory.validate().is_ok());
    }
}
