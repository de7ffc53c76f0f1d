pub mod smartseq3;
pub mod tenx;

pub use smartseq3::SmartSeq3Project;
pub use tenx::TenXProject;

use std::sync::Arc;

use log::error;
use serde_json::Value;
use yggdrasil_db::YggdrasilDbManager;

use crate::hpc::JobManager;
use crate::realm::RealmProject;

/// Build-time realm registry: the module ids that `module_registry.json`
/// entries point at. This is the only extension point for realms; there is
/// no runtime code loading.
pub async fn build(
    module_location: &str,
    doc: Value,
    ydm: Arc<YggdrasilDbManager>,
    hpc: Arc<dyn JobManager>,
) -> Option<Box<dyn RealmProject>> {
    match module_location {
        "smartseq3" => Some(Box::new(SmartSeq3Project::new(doc, ydm, hpc).await)),
        "tenx" => Some(Box::new(TenXProject::new(doc, ydm, hpc).await)),
        other => {
            error!("Unknown realm module '{other}'.");
            None
        }
    }
}
