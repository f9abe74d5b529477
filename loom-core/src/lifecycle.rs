//! Dependency-ordered component startup and bounded-deadline shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct LifecycleOrchestrator {
    components: Vec<Arc<dyn Component>>,
    grace: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_fired: AtomicBool,
}

impl LifecycleOrchestrator {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            components: Vec::new(),
            grace,
            shutdown_tx,
            shutdown_fired: AtomicBool::new(false),
        }
    }

    pub fn register(&mut self, component: Arc<dyn Component>) {
        self.components.push(component);
    }

    /// Receiver every long-running task selects on.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Kahn's algorithm over declared dependencies.
    fn startup_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name(), i))
            .collect();

        let mut in_degree = vec![0usize; self.components.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.components.len()];
        for (i, component) in self.components.iter().enumerate() {
            for dep in component.dependencies() {
                let dep_index = *index
                    .get(dep)
                    .with_context(|| format!("{} depends on unknown component {dep}", component.name()))?;
                edges[dep_index].push(i);
                in_degree[i] += 1;
            }
        }

        // Seed in registration order so independent components keep a
        // stable, declared ordering.
        let mut queue: VecDeque<usize> = (0..self.components.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.components.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &edges[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.components.len() {
            anyhow::bail!("component dependency cycle detected");
        }
        Ok(order)
    }

    /// Bring components up serially in dependency order. A failure stops
    /// startup and leaves already-started components for shutdown.
    pub async fn start_all(&self) -> Result<()> {
        for i in self.startup_order()? {
            let component = &self.components[i];
            info!("Starting component: {}", component.name());
            component
                .start()
                .await
                .with_context(|| format!("Failed to start {}", component.name()))?;
        }
        info!("All components started");
        Ok(())
    }

    /// Flip the shutdown signal exactly once; re-entrant calls are
    /// ignored.
    pub fn trigger_shutdown(&self) {
        if self
            .shutdown_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown requested");
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Stop components in reverse startup order, each under the grace
    /// deadline; exceeding it escalates to cancellation (the component's
    /// tasks are abandoned and torn down with the process).
    pub async fn shutdown_all(&self) {
        self.trigger_shutdown();

        let order = match self.startup_order() {
            Ok(order) => order,
            Err(_) => (0..self.components.len()).collect(),
        };

        for i in order.into_iter().rev() {
            let component = &self.components[i];
            info!("Stopping component: {}", component.name());
            match tokio::time::timeout(self.grace, component.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Component {} failed to stop: {e:#}", component.name());
                }
                Err(_) => {
                    warn!(
                        "Component {} exceeded the {}s shutdown deadline, cancelling",
                        component.name(),
                        self.grace.as_secs()
                    );
                }
            }
        }
        info!("Shutdown complete");
    }

    /// Block until SIGINT/SIGTERM, then trigger shutdown. Only the first
    /// signal acts; the handler stays installed so repeats are swallowed.
    pub async fn wait_for_signals(&self) {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        self.trigger_shutdown();
    }
}
