//! Typed subscriptions to fabric metrics on top of the task scheduler.
//!
//! Every subscribe call registers a callback on a task keyed by what it
//! polls, so two consumers of the same group share one request per cycle.
//! Configuration lookups go through [`FabricCache`] and are invalidated by
//! the notices this service polls.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{FabricCache, InvalidationReport};
use crate::error::{FetchError, SchedulerError};
use crate::export::health::HealthMetrics;
use crate::fabric::{
    GroupConfig, GroupInfo, ImageId, ImageInfo, Notice, PerformanceSource, PmConfig,
    PortCounters, VfConfig, VfInfo,
};
use crate::scheduler::{TaskList, TaskScheduler};
use crate::task::batched::{Batch, BatchedCallback};
use crate::task::{producer, CallbackRef, Task, TaskId, TaskKey, TaskKind};

/// Handle to a batched multi-group subscription.
pub struct GroupBatch {
    batch: Arc<BatchedCallback<GroupInfo>>,
    members: Vec<(String, CallbackRef<GroupInfo>)>,
}

impl GroupBatch {
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(g, _)| g.as_str())
    }

    pub fn batches_delivered(&self) -> u64 {
        self.batch.batches_delivered()
    }

    pub fn late_arrivals(&self) -> u64 {
        self.batch.late_arrivals()
    }
}

pub struct PerfService<S> {
    source: Arc<S>,
    scheduler: Arc<TaskScheduler>,
    cache: Arc<FabricCache>,
    metrics: Option<Arc<HealthMetrics>>,
    images: Arc<TaskList<ImageInfo>>,
    groups: Arc<TaskList<GroupInfo>>,
    vfs: Arc<TaskList<VfInfo>>,
    ports: Arc<TaskList<PortCounters>>,
    notices: Arc<TaskList<Vec<Notice>>>,
}

impl<S: PerformanceSource> PerfService<S> {
    pub fn new(
        source: Arc<S>,
        scheduler: Arc<TaskScheduler>,
        cache: FabricCache,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            images: scheduler.task_list("image_info"),
            groups: scheduler.task_list("group_info"),
            vfs: scheduler.task_list("vf_info"),
            ports: scheduler.task_list("port_counters"),
            notices: scheduler.task_list("notices"),
            source,
            scheduler,
            cache: Arc::new(cache),
            metrics,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn subscribe_image_info(
        &self,
        callback: CallbackRef<ImageInfo>,
    ) -> Result<Arc<Task<ImageInfo>>, SchedulerError> {
        let src = Arc::clone(&self.source);
        let produce = producer(move || {
            let src = Arc::clone(&src);
            async move { src.image_info(ImageId::LATEST).await }
        });
        self.scheduler.schedule_task(
            &self.images,
            Task::new(TaskKind::ImageInfo, TaskKey::None, "latest image info"),
            callback,
            produce,
        )
    }

    pub fn unsubscribe_image_info(&self, callback: &CallbackRef<ImageInfo>) -> bool {
        self.scheduler.remove_task(
            &self.images,
            &TaskId::new(TaskKind::ImageInfo, TaskKey::None),
            callback,
        )
    }

    pub fn subscribe_group_info(
        &self,
        group: &str,
        callback: CallbackRef<GroupInfo>,
    ) -> Result<Arc<Task<GroupInfo>>, SchedulerError> {
        let src = Arc::clone(&self.source);
        let name = group.to_string();
        let produce = producer(move || {
            let src = Arc::clone(&src);
            let name = name.clone();
            async move { src.group_info(&name, ImageId::LATEST).await }
        });
        self.scheduler.schedule_task(
            &self.groups,
            Task::new(
                TaskKind::GroupInfo,
                TaskKey::Name(group.to_string()),
                format!("group info for {group}"),
            ),
            callback,
            produce,
        )
    }

    pub fn unsubscribe_group_info(&self, group: &str, callback: &CallbackRef<GroupInfo>) -> bool {
        self.scheduler.remove_task(
            &self.groups,
            &TaskId::new(TaskKind::GroupInfo, TaskKey::Name(group.to_string())),
            callback,
        )
    }

    pub fn subscribe_vf_info(
        &self,
        vf: &str,
        callback: CallbackRef<VfInfo>,
    ) -> Result<Arc<Task<VfInfo>>, SchedulerError> {
        let src = Arc::clone(&self.source);
        let name = vf.to_string();
        let produce = producer(move || {
            let src = Arc::clone(&src);
            let name = name.clone();
            async move { src.vf_info(&name, ImageId::LATEST).await }
        });
        self.scheduler.schedule_task(
            &self.vfs,
            Task::new(
                TaskKind::VfInfo,
                TaskKey::Name(vf.to_string()),
                format!("vf info for {vf}"),
            ),
            callback,
            produce,
        )
    }

    pub fn unsubscribe_vf_info(&self, vf: &str, callback: &CallbackRef<VfInfo>) -> bool {
        self.scheduler.remove_task(
            &self.vfs,
            &TaskId::new(TaskKind::VfInfo, TaskKey::Name(vf.to_string())),
            callback,
        )
    }

    pub fn subscribe_port_counters(
        &self,
        lid: u32,
        port: u8,
        callback: CallbackRef<PortCounters>,
    ) -> Result<Arc<Task<PortCounters>>, SchedulerError> {
        let src = Arc::clone(&self.source);
        let produce = producer(move || {
            let src = Arc::clone(&src);
            async move { src.port_counters(lid, port, ImageId::LATEST).await }
        });
        self.scheduler.schedule_task(
            &self.ports,
            Task::new(
                TaskKind::PortCounters,
                TaskKey::Port { lid, port },
                format!("counters for port {lid}:{port}"),
            ),
            callback,
            produce,
        )
    }

    pub fn unsubscribe_port_counters(
        &self,
        lid: u32,
        port: u8,
        callback: &CallbackRef<PortCounters>,
    ) -> bool {
        self.scheduler.remove_task(
            &self.ports,
            &TaskId::new(TaskKind::PortCounters, TaskKey::Port { lid, port }),
            callback,
        )
    }

    /// Subscribes to fabric notices. Every polled batch invalidates the
    /// configuration caches it affects before subscribers see it.
    pub fn subscribe_notices(
        &self,
        callback: CallbackRef<Vec<Notice>>,
    ) -> Result<Arc<Task<Vec<Notice>>>, SchedulerError> {
        let src = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let produce = producer(move || {
            let src = Arc::clone(&src);
            let cache = Arc::clone(&cache);
            async move {
                let notices = src.notices().await?;
                for notice in &notices {
                    cache.on_notice(notice);
                }
                Ok(notices)
            }
        });
        self.scheduler.schedule_task(
            &self.notices,
            Task::new(TaskKind::Notices, TaskKey::None, "fabric notices"),
            callback,
            produce,
        )
    }

    pub fn unsubscribe_notices(&self, callback: &CallbackRef<Vec<Notice>>) -> bool {
        self.scheduler.remove_task(
            &self.notices,
            &TaskId::new(TaskKind::Notices, TaskKey::None),
            callback,
        )
    }

    /// Polls `groups` every cycle and delivers their results together.
    ///
    /// `callback` receives one batch per cycle with the group results in the
    /// order given. If registration fails part-way, the groups already
    /// subscribed are released again.
    pub fn subscribe_groups(
        &self,
        name: &str,
        groups: &[String],
        callback: CallbackRef<Batch<GroupInfo>>,
    ) -> Result<GroupBatch, SchedulerError> {
        let batch = match &self.metrics {
            Some(m) => BatchedCallback::with_metrics(name, groups.len(), callback, Arc::clone(m))?,
            None => BatchedCallback::new(name, groups.len(), callback)?,
        };

        let mut handle = GroupBatch {
            members: Vec::with_capacity(groups.len()),
            batch,
        };
        for (group, member) in groups.iter().zip(handle.batch.members()) {
            if let Err(e) = self.subscribe_group_info(group, Arc::clone(&member)) {
                self.unsubscribe_groups(&handle);
                return Err(e);
            }
            handle.members.push((group.clone(), member));
        }

        info!(batch = name, groups = groups.len(), "batched group subscription registered");
        Ok(handle)
    }

    /// Releases every member of a batched subscription. Returns how many
    /// members were still registered.
    pub fn unsubscribe_groups(&self, handle: &GroupBatch) -> usize {
        handle
            .members
            .iter()
            .filter(|(group, member)| self.unsubscribe_group_info(group, member))
            .count()
    }

    pub async fn group_list(&self) -> Result<Arc<Vec<String>>, FetchError> {
        self.cache.group_list(self.source.as_ref()).await
    }

    pub async fn group_config(&self, group: &str) -> Result<Arc<GroupConfig>, FetchError> {
        self.cache.group_config(self.source.as_ref(), group).await
    }

    pub async fn vf_list(&self) -> Result<Arc<Vec<String>>, FetchError> {
        self.cache.vf_list(self.source.as_ref()).await
    }

    pub async fn vf_config(&self, vf: &str) -> Result<Arc<VfConfig>, FetchError> {
        self.cache.vf_config(self.source.as_ref(), vf).await
    }

    pub async fn pm_config(&self) -> Result<Arc<PmConfig>, FetchError> {
        self.cache.pm_config(self.source.as_ref()).await
    }

    /// Applies notices received outside the polled subscription.
    pub fn on_notices(&self, notices: &[Notice]) -> Vec<InvalidationReport> {
        let reports: Vec<_> = notices.iter().map(|n| self.cache.on_notice(n)).collect();
        debug!(notices = notices.len(), "applied notices to fabric caches");
        reports
    }

    pub fn invalidate_caches(&self) {
        self.cache.invalidate_all();
    }

    /// Number of scheduled tasks across every metric kind.
    pub fn task_count(&self) -> usize {
        self.images.len() + self.groups.len() + self.vfs.len() + self.ports.len() + self.notices.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::cache::fabric::tests::StaticSource;
    use crate::config::SchedulerConfig;
    use crate::event::{NodeType, Severity};
    use crate::fabric::NoticeKind;
    use crate::task::FnCallback;

    fn service() -> PerfService<StaticSource> {
        let cfg = SchedulerConfig {
            recurring_pool_size: 2,
            background_pool_size: 4,
            background_queue_size: 8,
            task_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(1),
        };
        let scheduler = Arc::new(TaskScheduler::new(cfg, Duration::from_secs(10), None));
        PerfService::new(
            Arc::new(StaticSource::default()),
            scheduler,
            FabricCache::new(16, Duration::from_secs(300), None),
            None,
        )
    }

    fn names(log: &Arc<Mutex<Vec<String>>>) -> CallbackRef<GroupInfo> {
        let log = Arc::clone(log);
        FnCallback::new(move |info: Arc<GroupInfo>| {
            log.lock().push(info.name.clone());
            Ok(())
        })
        .into_ref()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_group_shares_one_task() {
        let svc = service();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = names(&log);
        let b = names(&log);

        svc.subscribe_group_info("Edge", Arc::clone(&a)).expect("subscribe");
        svc.subscribe_group_info("Edge", Arc::clone(&b)).expect("subscribe");
        assert_eq!(svc.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.lock(), vec!["Edge", "Edge"]);

        assert!(svc.unsubscribe_group_info("Edge", &a));
        assert_eq!(svc.task_count(), 1);
        assert!(svc.unsubscribe_group_info("Edge", &b));
        assert_eq!(svc.task_count(), 0);

        svc.scheduler().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_groups_delivered_in_order() {
        let svc = service();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let batches = Arc::clone(&batches);
            FnCallback::new(move |batch: Arc<Batch<GroupInfo>>| {
                batches
                    .lock()
                    .push(batch.iter().map(|g| g.name.clone()).collect::<Vec<_>>());
                Ok(())
            })
            .into_ref()
        };

        let groups = vec!["All".to_string(), "Edge".to_string()];
        let handle = svc.subscribe_groups("summary", &groups, sink).expect("subscribe");

        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        {
            let batches = batches.lock();
            assert_eq!(batches.len(), 2);
            assert!(batches.iter().all(|b| b == &["All", "Edge"]));
        }
        assert_eq!(handle.batches_delivered(), 2);
        assert_eq!(handle.groups().collect::<Vec<_>>(), ["All", "Edge"]);

        assert_eq!(svc.unsubscribe_groups(&handle), 2);
        assert_eq!(svc.task_count(), 0);
        svc.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let svc = service();
        let sink = FnCallback::new(|_: Arc<Batch<GroupInfo>>| Ok(())).into_ref();
        assert_eq!(
            svc.subscribe_groups("none", &[], sink).err(),
            Some(SchedulerError::EmptyBatch)
        );
        svc.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_notice_invalidates_cached_config() {
        let svc = service();

        svc.group_config("Edge").await.expect("config");
        svc.group_config("Edge").await.expect("config");
        assert_eq!(svc.source().group_config_calls.load(Ordering::SeqCst), 1);

        let reports = svc.on_notices(&[Notice {
            id: 9,
            time: 0,
            kind: NoticeKind::LinkChanged,
            severity: Severity::Error,
            node_type: NodeType::Hfi,
            lid: 1,
            node_desc: String::new(),
        }]);
        assert_eq!(reports[0].group_configs, 1);

        svc.group_config("Edge").await.expect("config");
        assert_eq!(svc.source().group_config_calls.load(Ordering::SeqCst), 2);
        svc.scheduler().shutdown().await;
    }
}
