use crate::warn;
use crate::worker::Worker;
use color_eyre::eyre::Report;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

struct Layer {
    path: PathBuf,
    delta: Option<Vec<u8>>,
}

struct SyncInner {
    layers: RefCell<Vec<Layer>>,
    latest_tag: Cell<usize>,
    syncs: RefCell<Vec<tokio::task::JoinHandle<()>>>,
}

/// Ordered, append-only log of directory snapshots the cluster enforces
/// onto each worker.
///
/// `latest_tag` counts the layers whose delta has been computed; layer `i`
/// has a delta iff `i < latest_tag`. The first worker to reach the head
/// computes each layer's delta exactly once; every other worker applies
/// the precomputed delta, so delta work is O(#layers) regardless of fleet
/// size.
#[derive(Clone)]
pub struct SyncStack {
    inner: Rc<SyncInner>,
}

impl Default for SyncStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStack {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SyncInner {
                layers: RefCell::new(Vec::new()),
                latest_tag: Cell::new(0),
                syncs: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Pushes a new snapshot layer; its delta is not yet known.
    pub fn append(&self, path: impl Into<PathBuf>) {
        self.inner.layers.borrow_mut().push(Layer {
            path: path.into(),
            delta: None,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.layers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.layers.borrow().is_empty()
    }

    pub fn latest_tag(&self) -> usize {
        self.inner.latest_tag.get()
    }

    /// Whether some layer is still waiting for its delta.
    pub fn has_unknown_delta(&self) -> bool {
        self.latest_tag() < self.len()
    }

    /// Whether `worker` lags behind the computed layers.
    pub fn need_sync(&self, worker: &Worker) -> bool {
        worker.sync_tag() < self.latest_tag()
    }

    /// Computes the next layer's delta using `worker`, which must be at the
    /// head of the stack.
    pub async fn update_delta(&self, worker: &Worker) -> Result<(), Report> {
        assert!(self.has_unknown_delta());
        assert_eq!(worker.sync_tag(), self.latest_tag());
        let index = self.latest_tag();
        let path = self.inner.layers.borrow()[index].path.clone();
        let delta = worker.calc_dir_delta(&path).await?;
        self.inner.layers.borrow_mut()[index].delta = Some(delta);
        self.inner.latest_tag.set(index + 1);
        Ok(())
    }

    /// Spawns a cooperative task that applies every computed layer `worker`
    /// has not yet seen, in order.
    pub fn start_sync(&self, worker: &Worker) {
        worker.set_syncing(true);
        let stack = self.clone();
        let worker = worker.clone();
        let handle = tokio::task::spawn_local(async move {
            while worker.sync_tag() < stack.latest_tag() {
                let (path, delta) = stack.layer(worker.sync_tag());
                if let Err(e) = worker.sync_with_delta(delta, &path).await {
                    // leave the tag where it is; the scheduler keeps the
                    // worker quiesced and retries on a later pass
                    warn!(
                        "[sync] error syncing {:?} on {:?}: {:?}",
                        path, worker, e
                    );
                    break;
                }
            }
            worker.set_syncing(false);
        });
        self.inner.syncs.borrow_mut().push(handle);
    }

    fn layer(&self, index: usize) -> (PathBuf, Vec<u8>) {
        let layers = self.inner.layers.borrow();
        let layer = &layers[index];
        let delta = layer
            .delta
            .clone()
            .expect("layer below latest_tag should have a delta");
        (layer.path.clone(), delta)
    }

    /// Aborts every pending per-worker sync task.
    pub fn stop(&self) {
        for handle in self.inner.syncs.borrow_mut().drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn push_computed(
        &self,
        path: impl Into<PathBuf>,
        delta: Vec<u8>,
    ) {
        self.inner.layers.borrow_mut().push(Layer {
            path: path.into(),
            delta: Some(delta),
        });
        self.inner.latest_tag.set(self.inner.latest_tag.get() + 1);
    }
}
