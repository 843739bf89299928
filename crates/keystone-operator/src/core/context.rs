//!
//! # Operator context
//!
//! State shared by the controller and every reconcile: the store, the owner
//! index, operator configuration and the desired state builder holding the
//! keystone.conf template.
//!
use std::sync::Arc;

use keystone_config::IniConfig;
use keystone_metadata::ChildKind;

use crate::config::OperatorConfig;
use crate::controllers::desired::DesiredStateBuilder;
use crate::controllers::owner_index::{OwnerIndex, SharedOwnerIndex, controller_owner};
use crate::stores::SharedStore;

pub type SharedContext<C> = Arc<Context<C>>;

#[derive(Debug)]
pub struct Context<C> {
    store: SharedStore<C>,
    index: SharedOwnerIndex,
    config: OperatorConfig,
    builder: DesiredStateBuilder,
}

impl<C> Context<C> {
    /// context with deployments indexed by their controlling server
    pub fn shared(store: SharedStore<C>, config: OperatorConfig, template: IniConfig) -> Arc<Self> {
        let index = OwnerIndex::shared();
        index.index_by(ChildKind::Deployment, controller_owner);
        Self::shared_with_index(store, index, config, template)
    }

    pub fn shared_with_index(
        store: SharedStore<C>,
        index: SharedOwnerIndex,
        config: OperatorConfig,
        template: IniConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            index,
            config,
            builder: DesiredStateBuilder::new(Arc::new(template)),
        })
    }

    pub fn store(&self) -> &SharedStore<C> {
        &self.store
    }

    pub fn index(&self) -> &SharedOwnerIndex {
        &self.index
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn builder(&self) -> &DesiredStateBuilder {
        &self.builder
    }
}
