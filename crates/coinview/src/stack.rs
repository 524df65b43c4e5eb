//! Navigation through a chain of coin view decorators.

use std::sync::Arc;

use crate::CoinView;

#[derive(Clone)]
pub struct CoinViewStack {
    top: Arc<dyn CoinView>,
}

impl CoinViewStack {
    pub fn new(top: Arc<dyn CoinView>) -> Self {
        Self { top }
    }

    pub fn top(&self) -> &Arc<dyn CoinView> {
        &self.top
    }

    /// Every layer from the outermost decorator down to the backing view.
    pub fn layers(&self) -> Vec<Arc<dyn CoinView>> {
        let mut layers = vec![Arc::clone(&self.top)];
        while let Some(next) = layers.last().and_then(|layer| layer.inner()) {
            layers.push(next);
        }
        layers
    }

    /// The outermost layer of concrete type `T`.
    pub fn find<T: CoinView + 'static>(&self) -> Option<Arc<T>> {
        self.layers()
            .into_iter()
            .find_map(|layer| layer.into_any().downcast::<T>().ok())
    }

    pub fn bottom(&self) -> Arc<dyn CoinView> {
        let mut layer = Arc::clone(&self.top);
        while let Some(next) = layer.inner() {
            layer = next;
        }
        layer
    }
}
