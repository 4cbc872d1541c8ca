use serde::{Deserialize, Serialize};

/// Where in the experiment the driver currently is.
///
/// A field is present only while the driver is inside that scope. Scopes are
/// entered outermost first and left innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blk_grp_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tr_id: Option<u32>,
}

impl IdentityContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn run_id(&self) -> Option<u32> {
        self.run_id
    }

    pub fn blk_grp_id(&self) -> Option<u32> {
        self.blk_grp_id
    }

    pub fn block_id(&self) -> Option<u32> {
        self.block_id
    }

    pub fn tr_id(&self) -> Option<u32> {
        self.tr_id
    }

    pub fn enter_run(&mut self, run_id: u32) {
        debug_assert!(!self.in_run(), "previous run scope was not cleared");
        self.run_id = Some(run_id);
    }

    pub fn enter_block_group(&mut self, blk_grp_id: u32) {
        self.blk_grp_id = Some(blk_grp_id);
    }

    pub fn enter_block(&mut self, block_id: u32) {
        self.block_id = Some(block_id);
    }

    pub fn enter_trial(&mut self, tr_id: u32) {
        self.tr_id = Some(tr_id);
    }

    pub fn leave_trial(&mut self) {
        self.tr_id = None;
    }

    pub fn leave_block(&mut self) {
        self.tr_id = None;
        self.block_id = None;
    }

    pub fn leave_block_group(&mut self) {
        self.leave_block();
        self.blk_grp_id = None;
    }

    /// Clear every run-scoped field. Also used after an aborted run so the
    /// next run starts clean.
    pub fn leave_run(&mut self) {
        self.leave_block_group();
        self.run_id = None;
    }

    pub fn in_run(&self) -> bool {
        self.run_id.is_some()
            || self.blk_grp_id.is_some()
            || self.block_id.is_some()
            || self.tr_id.is_some()
    }
}
