pub(crate) mod backing;
pub(crate) mod global;
pub(crate) mod integration;
pub(crate) mod manager;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod scoped;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod thread_local;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
