pub mod controller;
pub mod desired;
pub mod owner_index;
pub mod reconciler;

pub use controller::{KeystoneController, reconcile_all};
pub use desired::{DesiredState, DesiredStateBuilder, ValidatedSpec};
pub use owner_index::{ChildRef, OwnerIndex, SharedOwnerIndex, controller_owner};
pub use reconciler::{Action, Phase, Reconciler};
