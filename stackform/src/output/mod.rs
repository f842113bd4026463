//! Asynchronous single-assignment values.
//!
//! An [`Output`] stands for an attribute that is only known once some
//! resource has been created: a generated id, an address, an echoed
//! credential. It settles exactly once, either resolved or failed, and every
//! reader observes the same settlement.
//!
//! Outputs remember which resources they were derived from (their *owners*).
//! The graph builder reads those owners to discover data dependencies, so
//! combinators such as [`Output::map`] and [`Output::combine`] carry the
//! owner set forward.

mod interpolate;
mod value;


pub use interpolate::format;
pub use value::{json_to_string, Input, Value};

use crate::errors::{AlreadyResolvedError, OutputError};
use crate::resource::ResourceId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The result an output settles with.
pub type Settlement<T> = Result<T, OutputError>;

type Continuation<T> = Box<dyn FnOnce(Settlement<T>) + Send>;

/// Observable state of an output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputState<T> {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved(T),
    /// Settled with an error.
    Failed(OutputError),
}

impl<T> OutputState<T> {
    /// Returns true if the output has not settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns true if the output resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if the output failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl<T: Clone> OutputState<T> {
    fn settlement(&self) -> Option<Settlement<T>> {
        match self {
            Self::Pending => None,
            Self::Resolved(value) => Some(Ok(value.clone())),
            Self::Failed(error) => Some(Err(error.clone())),
        }
    }
}

struct Slot<T> {
    state: OutputState<T>,
    continuations: Vec<Continuation<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    owners: BTreeSet<ResourceId>,
    secret: bool,
    label: Option<String>,
}

/// A value that becomes known later.
///
/// Cloning an `Output` is cheap and yields another handle to the same cell.
pub struct Output<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Output<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unresolved output with no owners.
    #[must_use]
    pub fn pending() -> Self {
        Self::with_parts(BTreeSet::new(), false, None)
    }

    /// Creates an output that is already resolved.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let output = Self::pending();
        output.store(Ok(value));
        output
    }

    /// Creates an output that has already failed.
    #[must_use]
    pub fn failed(error: OutputError) -> Self {
        let output = Self::pending();
        output.store(Err(error));
        output
    }

    /// Creates a resolved output whose value is redacted from logs and reports.
    #[must_use]
    pub fn secret(value: T) -> Self {
        let output = Self::with_parts(BTreeSet::new(), true, None);
        output.store(Ok(value));
        output
    }

    pub(crate) fn with_parts(
        owners: BTreeSet<ResourceId>,
        secret: bool,
        label: Option<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: OutputState::Pending,
                    continuations: Vec::new(),
                }),
                owners,
                secret,
                label,
            }),
        }
    }

    /// Resolves the output.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyResolvedError`] if the output already settled.
    pub fn resolve(&self, value: T) -> Result<(), AlreadyResolvedError> {
        self.settle(Ok(value))
    }

    /// Fails the output.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyResolvedError`] if the output already settled.
    pub fn fail(&self, error: OutputError) -> Result<(), AlreadyResolvedError> {
        self.settle(Err(error))
    }

    /// Settles the output and runs every registered continuation.
    ///
    /// Continuations run after the lock is released, so they may settle
    /// other outputs freely.
    pub(crate) fn settle(&self, settlement: Settlement<T>) -> Result<(), AlreadyResolvedError> {
        let continuations = {
            let mut slot = self.shared.slot.lock();
            if !slot.state.is_pending() {
                return Err(AlreadyResolvedError::new(self.describe()));
            }
            slot.state = match &settlement {
                Ok(value) => OutputState::Resolved(value.clone()),
                Err(error) => OutputState::Failed(error.clone()),
            };
            std::mem::take(&mut slot.continuations)
        };

        for continuation in continuations {
            continuation(settlement.clone());
        }
        Ok(())
    }

    // Only used on freshly built outputs, which cannot already be settled.
    fn store(&self, settlement: Settlement<T>) {
        let _ = self.settle(settlement);
    }

    /// Registers `callback` to run once the output settles.
    ///
    /// Runs immediately if the output has already settled.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(Settlement<T>) + Send + 'static,
    {
        let settled = {
            let mut slot = self.shared.slot.lock();
            let current = slot.state.settlement();
            match current {
                Some(settled) => settled,
                None => {
                    slot.continuations.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(settled);
    }

    /// Waits for the output to settle.
    pub async fn get(&self) -> Settlement<T> {
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |settled| {
            let _ = tx.send(settled);
        });
        rx.await.unwrap_or_else(|_| {
            Err(OutputError::Cancelled(format!(
                "{} was dropped before settling",
                self.describe()
            )))
        })
    }

    /// Returns the settlement if the output has settled.
    #[must_use]
    pub fn try_get(&self) -> Option<Settlement<T>> {
        self.shared.slot.lock().state.settlement()
    }

    /// Returns a snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> OutputState<T> {
        self.shared.slot.lock().state.clone()
    }

    /// Returns true if the output has settled either way.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.shared.slot.lock().state.is_pending()
    }

    /// Returns the resources this output was derived from.
    #[must_use]
    pub fn owners(&self) -> &BTreeSet<ResourceId> {
        &self.shared.owners
    }

    /// Returns true if the value must not appear in logs or reports.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        self.shared.secret
    }

    /// Returns a handle to the same value, marked secret.
    #[must_use]
    pub fn as_secret(&self) -> Self {
        self.forward(self.owners().clone(), true)
    }

    /// Forwards this output under an extra owner.
    ///
    /// Used by components to republish a child output: the result settles
    /// exactly as the source does.
    pub(crate) fn republish(&self, owner: ResourceId) -> Self {
        let mut owners = self.owners().clone();
        owners.insert(owner);
        self.forward(owners, self.is_secret())
    }

    fn forward(&self, owners: BTreeSet<ResourceId>, secret: bool) -> Self {
        let forwarded = Self::with_parts(owners, secret, self.shared.label.clone());
        let target = forwarded.clone();
        self.on_settled(move |settled| target.store(settled));
        forwarded
    }

    /// Transforms the resolved value.
    ///
    /// A failure propagates without calling `f`.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transforms the resolved value with a fallible function.
    #[must_use]
    pub fn try_map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, OutputError> + Send + 'static,
    {
        let derived = Output::<U>::with_parts(self.owners().clone(), self.is_secret(), None);
        let target = derived.clone();
        self.on_settled(move |settled| target.store(settled.and_then(f)));
        derived
    }

    /// Pairs this output with another.
    ///
    /// Resolves once both resolve; fails with whichever failure is observed
    /// first.
    #[must_use]
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        let owners = self.owners().union(other.owners()).cloned().collect();
        let paired = Output::<(T, U)>::with_parts(owners, self.is_secret() || other.is_secret(), None);
        let halves: Arc<Mutex<(Option<T>, Option<U>)>> = Arc::new(Mutex::new((None, None)));

        let (target, left) = (paired.clone(), Arc::clone(&halves));
        self.on_settled(move |settled| match settled {
            Ok(value) => {
                let complete = {
                    let mut halves = left.lock();
                    halves.0 = Some(value);
                    take_pair(&mut halves)
                };
                if let Some(pair) = complete {
                    target.store(Ok(pair));
                }
            }
            Err(error) => target.store(Err(error)),
        });

        let (target, right) = (paired.clone(), halves);
        other.on_settled(move |settled| match settled {
            Ok(value) => {
                let complete = {
                    let mut halves = right.lock();
                    halves.1 = Some(value);
                    take_pair(&mut halves)
                };
                if let Some(pair) = complete {
                    target.store(Ok(pair));
                }
            }
            Err(error) => target.store(Err(error)),
        });

        paired
    }

    /// Joins several outputs into one ordered sequence.
    ///
    /// The combined output resolves once every input resolves and fails with
    /// the first failure observed. Inputs that settle afterwards still settle
    /// for their other readers.
    #[must_use]
    pub fn combine<I>(outputs: I) -> Output<Vec<T>>
    where
        I: IntoIterator<Item = Self>,
    {
        let outputs: Vec<Self> = outputs.into_iter().collect();
        let owners = outputs
            .iter()
            .flat_map(|output| output.owners().iter().cloned())
            .collect();
        let secret = outputs.iter().any(Self::is_secret);
        let combined = Output::<Vec<T>>::with_parts(owners, secret, None);

        if outputs.is_empty() {
            combined.store(Ok(Vec::new()));
            return combined;
        }

        let gather = Arc::new(Mutex::new(Gather {
            values: vec![None; outputs.len()],
            remaining: outputs.len(),
        }));

        for (index, output) in outputs.iter().enumerate() {
            let gather = Arc::clone(&gather);
            let target = combined.clone();
            output.on_settled(move |settled| match settled {
                Ok(value) => {
                    let complete = gather.lock().fill(index, value);
                    if let Some(values) = complete {
                        // Already failed if another input got there first.
                        let _ = target.resolve(values);
                    }
                }
                Err(error) => {
                    let _ = target.fail(error);
                }
            });
        }

        combined
    }

    fn describe(&self) -> String {
        match (&self.shared.label, self.shared.owners.first()) {
            (Some(label), _) => format!("'{label}'"),
            (None, Some(owner)) => format!("derived from '{owner}'"),
            (None, None) => "(free)".to_string(),
        }
    }
}

fn take_pair<T, U>(halves: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    if halves.0.is_some() && halves.1.is_some() {
        halves.0.take().zip(halves.1.take())
    } else {
        None
    }
}

struct Gather<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Gather<T> {
    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.values[index].is_none() {
            self.values[index] = Some(value);
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            Some(self.values.iter_mut().filter_map(Option::take).collect())
        } else {
            None
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        let mut debug = f.debug_struct("Output");
        if self.shared.secret && slot.state.is_resolved() {
            debug.field("state", &"Resolved([secret])");
        } else {
            debug.field("state", &slot.state);
        }
        debug.field("owners", &self.shared.owners).finish()
    }
}
