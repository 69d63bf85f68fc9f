use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::FetchError;
use crate::export::health::HealthMetrics;
use crate::fabric::{GroupConfig, Notice, PerformanceSource, PmConfig, VfConfig};

use super::{KeyedCache, LazyCache};

/// What a notice invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub group_configs: usize,
    pub vf_configs: usize,
    /// True when affectedness could not be determined and everything was cleared.
    pub full: bool,
}

/// Configuration caches for groups, virtual fabrics and the PM.
pub struct FabricCache {
    group_names: LazyCache<Vec<String>>,
    vf_names: LazyCache<Vec<String>>,
    pm_config: LazyCache<PmConfig>,
    group_configs: KeyedCache<String, GroupConfig>,
    vf_configs: KeyedCache<String, VfConfig>,
}

impl FabricCache {
    pub fn new(capacity: usize, ttl: Duration, metrics: Option<Arc<HealthMetrics>>) -> Self {
        let mut cache = Self {
            group_names: LazyCache::new("group_names"),
            vf_names: LazyCache::new("vf_names"),
            pm_config: LazyCache::new("pm_config"),
            group_configs: KeyedCache::new("group_configs", capacity, ttl),
            vf_configs: KeyedCache::new("vf_configs", capacity, ttl),
        };
        if let Some(m) = metrics {
            cache.group_names = cache.group_names.with_metrics(Arc::clone(&m));
            cache.vf_names = cache.vf_names.with_metrics(Arc::clone(&m));
            cache.pm_config = cache.pm_config.with_metrics(Arc::clone(&m));
            cache.group_configs = cache.group_configs.with_metrics(Arc::clone(&m));
            cache.vf_configs = cache.vf_configs.with_metrics(m);
        }
        cache
    }

    pub async fn group_list<S: PerformanceSource>(
        &self,
        src: &S,
    ) -> Result<Arc<Vec<String>>, FetchError> {
        self.group_names.get(|| src.group_list()).await
    }

    pub async fn vf_list<S: PerformanceSource>(
        &self,
        src: &S,
    ) -> Result<Arc<Vec<String>>, FetchError> {
        self.vf_names.get(|| src.vf_list()).await
    }

    pub async fn pm_config<S: PerformanceSource>(&self, src: &S) -> Result<Arc<PmConfig>, FetchError> {
        self.pm_config.get(|| src.pm_config()).await
    }

    pub async fn group_config<S: PerformanceSource>(
        &self,
        src: &S,
        name: &str,
    ) -> Result<Arc<GroupConfig>, FetchError> {
        self.group_configs
            .get(&name.to_string(), || src.group_config(name))
            .await
    }

    pub async fn vf_config<S: PerformanceSource>(
        &self,
        src: &S,
        name: &str,
    ) -> Result<Arc<VfConfig>, FetchError> {
        self.vf_configs
            .get(&name.to_string(), || src.vf_config(name))
            .await
    }

    /// Invalidates the configs affected by `notice`.
    ///
    /// Only cached configs containing the notice's node are cleared. When
    /// nothing cached can answer that (no node named, or no live entries to
    /// scan) every cache is cleared.
    pub fn on_notice(&self, notice: &Notice) -> InvalidationReport {
        let scannable = self.group_configs.ready_len() + self.vf_configs.ready_len() > 0;

        let Some(lid) = notice.affected_node().filter(|_| scannable) else {
            self.invalidate_all();
            info!(
                notice = notice.id,
                kind = notice.kind.as_str(),
                "notice affectedness unknown, cleared all fabric caches",
            );
            return InvalidationReport {
                full: true,
                ..Default::default()
            };
        };

        let report = InvalidationReport {
            group_configs: self.group_configs.invalidate_if(|_, c| c.contains_node(lid)),
            vf_configs: self.vf_configs.invalidate_if(|_, c| c.contains_node(lid)),
            full: false,
        };
        debug!(
            notice = notice.id,
            lid,
            groups = report.group_configs,
            vfs = report.vf_configs,
            "notice invalidated fabric caches",
        );
        report
    }

    pub fn invalidate_all(&self) {
        self.group_names.invalidate();
        self.vf_names.invalidate();
        self.pm_config.invalidate();
        self.group_configs.invalidate_all();
        self.vf_configs.invalidate_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::{NodeType, Severity};
    use crate::fabric::{
        GroupInfo, ImageId, ImageInfo, NoticeKind, PortCounters, PortMember, VfInfo,
    };

    /// In-memory source counting config retrievals.
    #[derive(Default)]
    pub(crate) struct StaticSource {
        pub group_config_calls: AtomicUsize,
        pub group_list_calls: AtomicUsize,
    }

    fn members(lids: &[u32]) -> Vec<PortMember> {
        lids.iter()
            .map(|&lid| PortMember {
                lid,
                port: 1,
                node_desc: String::new(),
            })
            .collect()
    }

    impl PerformanceSource for StaticSource {
        async fn image_info(&self, image: ImageId) -> Result<ImageInfo, FetchError> {
            Ok(ImageInfo {
                image_id: image,
                ..Default::default()
            })
        }

        async fn group_list(&self) -> Result<Vec<String>, FetchError> {
            self.group_list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["All".into(), "Edge".into()])
        }

        async fn group_info(&self, group: &str, image: ImageId) -> Result<GroupInfo, FetchError> {
            Ok(GroupInfo {
                name: group.into(),
                image_id: image,
                ..Default::default()
            })
        }

        async fn group_config(&self, group: &str) -> Result<GroupConfig, FetchError> {
            self.group_config_calls.fetch_add(1, Ordering::SeqCst);
            let lids: &[u32] = if group == "Edge" { &[1, 2] } else { &[3, 4] };
            Ok(GroupConfig {
                name: group.into(),
                members: members(lids),
            })
        }

        async fn vf_list(&self) -> Result<Vec<String>, FetchError> {
            Ok(vec!["Default".into()])
        }

        async fn vf_info(&self, vf: &str, image: ImageId) -> Result<VfInfo, FetchError> {
            Ok(VfInfo {
                name: vf.into(),
                image_id: image,
                ..Default::default()
            })
        }

        async fn vf_config(&self, vf: &str) -> Result<VfConfig, FetchError> {
            Ok(VfConfig {
                name: vf.into(),
                members: members(&[1]),
            })
        }

        async fn port_counters(
            &self,
            lid: u32,
            port: u8,
            image: ImageId,
        ) -> Result<PortCounters, FetchError> {
            Ok(PortCounters {
                lid,
                port,
                image_id: image,
                ..Default::default()
            })
        }

        async fn pm_config(&self) -> Result<PmConfig, FetchError> {
            Ok(PmConfig::default())
        }

        async fn notices(&self) -> Result<Vec<Notice>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn notice(lid: u32) -> Notice {
        Notice {
            id: 1,
            time: 0,
            kind: NoticeKind::NodeChanged,
            severity: Severity::Warning,
            node_type: NodeType::Switch,
            lid,
            node_desc: String::new(),
        }
    }

    #[tokio::test]
    async fn test_notice_invalidates_only_affected_configs() {
        let src = StaticSource::default();
        let cache = FabricCache::new(16, Duration::from_secs(300), None);

        cache.group_config(&src, "Edge").await.expect("edge");
        cache.group_config(&src, "Core").await.expect("core");
        cache.vf_config(&src, "Default").await.expect("vf");
        cache.group_list(&src).await.expect("names");

        let report = cache.on_notice(&notice(2));
        assert_eq!(
            report,
            InvalidationReport {
                group_configs: 1,
                vf_configs: 0,
                full: false
            }
        );

        cache.group_config(&src, "Core").await.expect("core");
        assert_eq!(src.group_config_calls.load(Ordering::SeqCst), 2);
        cache.group_config(&src, "Edge").await.expect("edge");
        assert_eq!(src.group_config_calls.load(Ordering::SeqCst), 3);

        cache.group_list(&src).await.expect("names");
        assert_eq!(src.group_list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notice_without_scannable_entries_clears_all() {
        let src = StaticSource::default();
        let cache = FabricCache::new(16, Duration::from_secs(300), None);

        cache.group_list(&src).await.expect("names");
        let report = cache.on_notice(&notice(2));
        assert!(report.full);

        cache.group_list(&src).await.expect("names");
        assert_eq!(src.group_list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_notice_without_node_clears_all() {
        let src = StaticSource::default();
        let cache = FabricCache::new(16, Duration::from_secs(300), None);

        cache.group_config(&src, "Edge").await.expect("edge");
        assert!(cache.on_notice(&notice(0)).full);
        cache.group_config(&src, "Edge").await.expect("edge");
        assert_eq!(src.group_config_calls.load(Ordering::SeqCst), 2);
    }
}
