//! Capability Binder
//!
//! Globals are advertised by the compositor in no particular order. Each kind
//! we need is recorded once when announced and bound once when its
//! prerequisites exist; nothing is ever unbound before teardown.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::pool::{FrameGeometry, FramePool};
use crate::present::PresentationSide;

/// Maximum number of outputs tracked at once. Outputs are only discovered,
/// never laid out, so a small fixed bound is a deliberate scope limit.
pub const MAX_OUTPUTS: usize = 3;

/// Kinds of presentation-side globals the bridge binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalKind {
    Compositor,
    Output,
    Shm,
    ShellBase,
    SessionLockManager,
}

impl GlobalKind {
    pub const ALL: [GlobalKind; 5] = [
        GlobalKind::Compositor,
        GlobalKind::Output,
        GlobalKind::Shm,
        GlobalKind::ShellBase,
        GlobalKind::SessionLockManager,
    ];

    /// Protocol interface name advertised in the registry
    pub fn interface(self) -> &'static str {
        match self {
            GlobalKind::Compositor => "wl_compositor",
            GlobalKind::Output => "wl_output",
            GlobalKind::Shm => "wl_shm",
            GlobalKind::ShellBase => "xdg_wm_base",
            GlobalKind::SessionLockManager => "ext_session_lock_manager_v1",
        }
    }

    pub fn from_interface(interface: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.interface() == interface)
    }

    /// Highest interface version the bridge knows how to drive
    pub fn max_version(self) -> u32 {
        match self {
            GlobalKind::Compositor => 4,
            GlobalKind::Output => 3,
            GlobalKind::Shm => 1,
            GlobalKind::ShellBase => 2,
            GlobalKind::SessionLockManager => 1,
        }
    }
}

impl fmt::Display for GlobalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.interface())
    }
}

/// Registry name and advertised version of one global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalId {
    pub name: u32,
    pub version: u32,
}

impl GlobalId {
    /// Version to request: the advertised one, capped at what we support
    pub fn bind_version(&self, kind: GlobalKind) -> u32 {
        self.version.min(kind.max_version())
    }
}

/// Announced but not necessarily bound globals. Every slot is write-once.
#[derive(Debug, Default)]
pub struct PendingGlobals {
    compositor: Option<GlobalId>,
    outputs: Vec<GlobalId>,
    shm: Option<GlobalId>,
    shell_base: Option<GlobalId>,
    session_lock: Option<GlobalId>,
}

impl PendingGlobals {
    fn slot_mut(&mut self, kind: GlobalKind) -> Option<&mut Option<GlobalId>> {
        match kind {
            GlobalKind::Compositor => Some(&mut self.compositor),
            GlobalKind::Shm => Some(&mut self.shm),
            GlobalKind::ShellBase => Some(&mut self.shell_base),
            GlobalKind::SessionLockManager => Some(&mut self.session_lock),
            GlobalKind::Output => None,
        }
    }

    fn contains(&self, name: u32) -> bool {
        [self.compositor, self.shm, self.shell_base, self.session_lock]
            .into_iter()
            .flatten()
            .chain(self.outputs.iter().copied())
            .any(|global| global.name == name)
    }
}

/// What has been constructed so far. Each flag goes false -> true once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BoundCapabilities {
    pub compositor: bool,
    pub surface: bool,
    pub outputs: usize,
    pub shm: bool,
    pub buffers: bool,
    pub shell_base: bool,
    pub toplevel: bool,
    pub session_lock: bool,
}

/// Incremental bind state machine
pub struct CapabilityBinder {
    pending: PendingGlobals,
    bound: BoundCapabilities,
    geometry: FrameGeometry,
    app_id: String,
}

impl CapabilityBinder {
    pub fn new(geometry: FrameGeometry, app_id: impl Into<String>) -> Self {
        Self {
            pending: PendingGlobals::default(),
            bound: BoundCapabilities::default(),
            geometry,
            app_id: app_id.into(),
        }
    }

    pub fn bound(&self) -> &BoundCapabilities {
        &self.bound
    }

    /// True once the surface exists and both buffer slots are usable
    pub fn frames_ready(&self) -> bool {
        self.bound.surface && self.bound.buffers
    }

    /// Record an announcement. Repeats and excess outputs are ignored.
    pub fn on_global_announced(&mut self, kind: GlobalKind, global: GlobalId) {
        if kind == GlobalKind::Output {
            if self.pending.outputs.len() >= MAX_OUTPUTS {
                debug!("Ignoring output {} beyond the first {}", global.name, MAX_OUTPUTS);
            } else {
                debug!("Output {} announced (v{})", global.name, global.version);
                self.pending.outputs.push(global);
            }
            return;
        }

        if let Some(slot) = self.pending.slot_mut(kind) {
            match slot {
                Some(existing) => {
                    debug!(
                        "Ignoring second {} announcement {} (keeping {})",
                        kind, global.name, existing.name
                    );
                }
                None => {
                    debug!("{} announced as {} (v{})", kind, global.name, global.version);
                    *slot = Some(global);
                }
            }
        }
    }

    /// Withdrawals are only logged. A bound object whose global disappears
    /// stays in use until teardown.
    pub fn on_global_removed(&mut self, name: u32) {
        if self.pending.contains(name) {
            warn!("Global {} was removed; the bound object is now stale", name);
        } else {
            debug!("Unrelated global {} removed", name);
        }
    }

    /// Bind whatever became bindable. Safe to call every iteration.
    ///
    /// The frame pool is created here, when the shm factory binds, and handed
    /// to the caller through `frames`.
    pub fn react<P: PresentationSide + ?Sized>(
        &mut self,
        present: &mut P,
        frames: &mut Option<FramePool>,
    ) -> Result<(), BridgeError> {
        if let (Some(global), false) = (self.pending.compositor, self.bound.compositor) {
            present.bind(GlobalKind::Compositor, global)?;
            self.bound.compositor = true;
            info!("Bound {} v{}", GlobalKind::Compositor, global.bind_version(GlobalKind::Compositor));

            present.create_surface()?;
            self.bound.surface = true;
            info!("Created surface");
        }

        while self.bound.outputs < self.pending.outputs.len() {
            let global = self.pending.outputs[self.bound.outputs];
            present.bind(GlobalKind::Output, global)?;
            self.bound.outputs += 1;
            info!("Bound output {} ({}/{})", global.name, self.bound.outputs, MAX_OUTPUTS);
        }

        if let (Some(global), false) = (self.pending.shm, self.bound.shm) {
            present.bind(GlobalKind::Shm, global)?;
            self.bound.shm = true;
            info!("Bound {}", GlobalKind::Shm);

            let pool = FramePool::create(self.geometry)?;
            present.create_buffers(&pool)?;
            *frames = Some(pool);
            self.bound.buffers = true;
            info!(
                "Created buffer slots ({}x{})",
                self.geometry.width, self.geometry.height
            );
        }

        if let (Some(global), false) = (self.pending.shell_base, self.bound.shell_base) {
            if self.bound.surface {
                present.bind(GlobalKind::ShellBase, global)?;
                self.bound.shell_base = true;
                info!("Bound {}", GlobalKind::ShellBase);

                present.create_toplevel(&self.app_id)?;
                self.bound.toplevel = true;
                // An empty commit prompts the first configure
                present.commit();
                info!("Created top-level '{}'", self.app_id);
            } else {
                debug!("Deferring {} until the surface exists", GlobalKind::ShellBase);
            }
        }

        if let (Some(global), false) = (self.pending.session_lock, self.bound.session_lock) {
            present.bind(GlobalKind::SessionLockManager, global)?;
            self.bound.session_lock = true;
            info!("Bound {}", GlobalKind::SessionLockManager);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Call, FakePresenter};

    fn global(name: u32) -> GlobalId {
        GlobalId { name, version: 9 }
    }

    fn binder() -> CapabilityBinder {
        CapabilityBinder::new(FrameGeometry::new(8, 4), "test-app")
    }

    #[test]
    fn test_interface_names_round_trip() {
        for kind in GlobalKind::ALL {
            assert_eq!(GlobalKind::from_interface(kind.interface()), Some(kind));
        }
        assert_eq!(GlobalKind::from_interface("wl_seat"), None);
    }

    #[test]
    fn test_bind_version_is_capped() {
        assert_eq!(global(1).bind_version(GlobalKind::Compositor), 4);
        let old = GlobalId { name: 1, version: 1 };
        assert_eq!(old.bind_version(GlobalKind::Compositor), 1);
    }

    #[test]
    fn test_shell_waits_for_surface() {
        let mut binder = binder();
        let mut present = FakePresenter::new();
        let mut frames = None;

        binder.on_global_announced(GlobalKind::ShellBase, global(5));
        binder.react(&mut present, &mut frames).unwrap();
        assert!(!binder.bound().shell_base);
        assert!(present.calls.is_empty());

        binder.on_global_announced(GlobalKind::Compositor, global(1));
        binder.react(&mut present, &mut frames).unwrap();
        assert!(binder.bound().toplevel);

        let surface_at = present.position(&Call::CreateSurface).unwrap();
        let toplevel_at = present.position(&Call::CreateToplevel("test-app".into())).unwrap();
        assert!(surface_at < toplevel_at);
        // Empty commit right after the top-level is created
        assert_eq!(present.calls[toplevel_at + 1], Call::Commit);
    }

    #[test]
    fn test_every_order_binds_each_kind_once() {
        let kinds = [
            GlobalKind::Compositor,
            GlobalKind::Output,
            GlobalKind::Shm,
            GlobalKind::ShellBase,
            GlobalKind::SessionLockManager,
        ];
        // All 120 orderings, reacting after every announcement
        let mut orders = vec![vec![]];
        for _ in 0..kinds.len() {
            let mut next = Vec::new();
            for order in &orders {
                for kind in kinds {
                    if !order.contains(&kind) {
                        let mut extended = order.clone();
                        extended.push(kind);
                        next.push(extended);
                    }
                }
            }
            orders = next;
        }
        assert_eq!(orders.len(), 120);

        for order in orders {
            let mut binder = binder();
            let mut present = FakePresenter::new();
            let mut frames = None;
            for (i, kind) in order.iter().enumerate() {
                binder.on_global_announced(*kind, global(i as u32 + 1));
                // Unrelated repeats interleaved with the real announcements
                binder.on_global_announced(*kind, global(100 + i as u32));
                binder.react(&mut present, &mut frames).unwrap();
                binder.react(&mut present, &mut frames).unwrap();
            }

            for kind in kinds {
                let expected = if kind == GlobalKind::Output { 2 } else { 1 };
                assert_eq!(present.binds_of(kind), expected, "{:?} in {:?}", kind, order);
            }
            assert_eq!(present.count(&Call::CreateSurface), 1);
            assert_eq!(present.count(&Call::CreateBuffers), 1);
            assert_eq!(present.count(&Call::CreateToplevel("test-app".into())), 1);
            assert!(
                present.position(&Call::CreateSurface)
                    < present.position(&Call::CreateToplevel("test-app".into()))
            );
            assert!(frames.is_some());
            assert!(binder.frames_ready());
        }
    }

    #[test]
    fn test_outputs_are_bounded() {
        let mut binder = binder();
        let mut present = FakePresenter::new();
        let mut frames = None;
        for name in 10..16 {
            binder.on_global_announced(GlobalKind::Output, global(name));
        }
        binder.react(&mut present, &mut frames).unwrap();
        assert_eq!(present.binds_of(GlobalKind::Output), MAX_OUTPUTS);
        assert_eq!(binder.bound().outputs, MAX_OUTPUTS);

        binder.on_global_announced(GlobalKind::Output, global(20));
        binder.react(&mut present, &mut frames).unwrap();
        assert_eq!(present.binds_of(GlobalKind::Output), MAX_OUTPUTS);
    }

    #[test]
    fn test_bind_failure_fails_reaction() {
        let mut binder = binder();
        let mut present = FakePresenter::new();
        present.fail_bind = Some(GlobalKind::Compositor);
        let mut frames = None;
        binder.on_global_announced(GlobalKind::Compositor, global(1));
        assert!(matches!(
            binder.react(&mut present, &mut frames),
            Err(BridgeError::Bind { kind: GlobalKind::Compositor, .. })
        ));
        assert!(!binder.bound().surface);
    }

    #[test]
    fn test_removal_is_only_logged() {
        let mut binder = binder();
        let mut present = FakePresenter::new();
        let mut frames = None;
        binder.on_global_announced(GlobalKind::Compositor, global(1));
        binder.react(&mut present, &mut frames).unwrap();
        binder.on_global_removed(1);
        binder.on_global_removed(42);
        binder.react(&mut present, &mut frames).unwrap();
        assert!(binder.bound().compositor);
        assert_eq!(present.binds_of(GlobalKind::Compositor), 1);
    }
}
