//!
//! # Initialization routines for the keystone operator
//!
use std::sync::Arc;

use tracing::info;

use crate::controllers::KeystoneController;
use crate::core::{CancelEvent, SharedContext};
use crate::stores::ResourceStore;

/// start the controller, firing the returned event stops it
pub fn start_main_loop<C>(ctx: SharedContext<C>) -> Arc<CancelEvent>
where
    C: ResourceStore + 'static,
{
    let config = ctx.config();
    info!(
        field_owner = %config.field_owner,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        apply_mode = ?config.apply_mode,
        "starting keystone operator"
    );

    KeystoneController::start(ctx)
}
