//! Async offload
//!
//! Control calls block until the facility answers. From async code they are
//! moved to the tokio blocking pool so the reactor keeps running.

use super::controller::SubflowController;
use super::endpoint::Endpoint;
use super::error::{Operation, Result, SubflowError};
use super::handle::{ControlDescriptor, MultipathConnection};
use super::options::SubflowOption;
use super::subflow::{Priority, Shutdown, Subflow, SubflowId, SubflowStatus};
use std::io;
use std::sync::Arc;

/// Async front end of [`SubflowController`]
#[derive(Debug, Clone)]
pub struct AsyncSubflowController {
    inner: Arc<SubflowController>,
}

impl From<SubflowController> for AsyncSubflowController {
    fn from(controller: SubflowController) -> Self {
        Self::new(Arc::new(controller))
    }
}

impl AsyncSubflowController {
    pub fn new(inner: Arc<SubflowController>) -> Self {
        Self { inner }
    }

    pub fn controller(&self) -> &SubflowController {
        &self.inner
    }

    async fn offload<T, F>(&self, op: Operation, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SubflowController) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|e| SubflowError::Handle {
                op,
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
    }

    pub async fn open<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
        local: impl Into<String>,
        remote: impl Into<String>,
        priority: Priority,
    ) -> Result<SubflowId>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        let (local, remote) = (local.into(), remote.into());
        self.offload(Operation::Open, move |ctl| ctl.open(&connection, &local, &remote, priority))
            .await
    }

    pub async fn close<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
        id: SubflowId,
        how: Shutdown,
    ) -> Result<()>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::Close, move |ctl| ctl.close(&connection, id, how)).await
    }

    pub async fn list<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
    ) -> Result<Vec<SubflowStatus>>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::List, move |ctl| ctl.list(&connection)).await
    }

    pub async fn inspect<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
        id: SubflowId,
    ) -> Result<(Endpoint, Endpoint)>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::Inspect, move |ctl| ctl.inspect(&connection, id)).await
    }

    pub async fn snapshot<C>(&self, connection: Arc<MultipathConnection<C>>) -> Result<Vec<Subflow>>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::List, move |ctl| ctl.snapshot(&connection)).await
    }

    pub async fn get<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
        id: SubflowId,
        option: SubflowOption,
    ) -> Result<i32>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::GetOption, move |ctl| ctl.get(&connection, id, option)).await
    }

    pub async fn set<C>(
        &self,
        connection: Arc<MultipathConnection<C>>,
        id: SubflowId,
        option: SubflowOption,
        value: i32,
    ) -> Result<()>
    where
        C: ControlDescriptor + Send + Sync + 'static,
    {
        self.offload(Operation::SetOption, move |ctl| ctl.set(&connection, id, option, value))
            .await
    }
}
