//! Services Registry
//!
//! Holds the validated service catalog and resolves a service id to the
//! identity and controller clients of its CSI driver. Clients are created
//! lazily on first use, at most once per service id, and reused for the
//! life of the process.

use crate::catalog::driver::{
    GrpcConnector, GrpcControllerClient, GrpcIdentityClient, NoopControllerClient,
    NoopIdentityClient,
};
use crate::catalog::{load_catalog, CatalogService, ServiceOffering};
use crate::domain::ports::{
    ControllerClient, ControllerClientRef, DriverChannel, DriverConnectorRef, IdentityClient,
    IdentityClientRef,
};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Per-service cache of one client kind
///
/// Each service id owns a cell; concurrent misses on the same id wait on
/// that cell instead of dialing twice. A failed dial leaves the cell empty.
type ClientCache<C> = DashMap<String, Arc<OnceCell<Arc<C>>>>;

/// Catalog plus lazily connected driver clients
pub struct ServicesRegistry {
    connector: DriverConnectorRef,
    services: Vec<ServiceOffering>,
    identity_clients: ClientCache<dyn IdentityClient>,
    controller_clients: ClientCache<dyn ControllerClient>,
}

impl ServicesRegistry {
    /// Validate the offerings and build an empty connection cache
    pub fn new(connector: DriverConnectorRef, services: Vec<ServiceOffering>) -> Result<Self> {
        if services.is_empty() {
            error!("Services config contains no services");
            return Err(Error::EmptyCatalog);
        }

        for (index, service) in services.iter().enumerate() {
            if !service.is_valid() {
                error!(index, service_id = %service.id, "Invalid service in services config");
                return Err(Error::InvalidOffering { index });
            }
        }

        info!(services = services.len(), "Services registry initialized");

        Ok(Self {
            connector,
            services,
            identity_clients: DashMap::new(),
            controller_clients: DashMap::new(),
        })
    }

    /// Load the services config file and build a registry dialing over gRPC
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let services = load_catalog(path)?;
        Self::new(Arc::new(GrpcConnector::default()), services)
    }

    /// Identity client for the driver serving `service_id`
    pub async fn identity_client(&self, service_id: &str) -> Result<IdentityClientRef> {
        if let Some(client) = cached(&self.identity_clients, service_id) {
            return Ok(client);
        }

        let service = self.find_service(service_id)?;
        if service.connection_address.is_empty() {
            return Ok(Arc::new(NoopIdentityClient));
        }

        self.resolve(&self.identity_clients, service, |channel| {
            Arc::new(GrpcIdentityClient::new(channel)) as IdentityClientRef
        })
        .await
    }

    /// Controller client for the driver serving `service_id`
    pub async fn controller_client(&self, service_id: &str) -> Result<ControllerClientRef> {
        if let Some(client) = cached(&self.controller_clients, service_id) {
            return Ok(client);
        }

        let service = self.find_service(service_id)?;
        if service.connection_address.is_empty() {
            return Ok(Arc::new(NoopControllerClient));
        }

        self.resolve(&self.controller_clients, service, |channel| {
            Arc::new(GrpcControllerClient::new(channel)) as ControllerClientRef
        })
        .await
    }

    /// Catalog in configuration order, as shown to the marketplace
    pub fn broker_services(&self) -> Vec<CatalogService> {
        self.services.iter().map(ServiceOffering::to_catalog).collect()
    }

    /// CSI driver name of the offering
    pub fn driver_name(&self, service_id: &str) -> Result<String> {
        self.find_service(service_id)
            .map(|service| service.driver_name.clone())
    }

    /// Ids of every configured offering, in configuration order
    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|service| service.id.clone()).collect()
    }

    fn find_service(&self, service_id: &str) -> Result<&ServiceOffering> {
        self.services
            .iter()
            .find(|service| service.id == service_id)
            .ok_or_else(|| Error::ServiceNotFound {
                service_id: service_id.to_string(),
            })
    }

    async fn resolve<C: ?Sized>(
        &self,
        cache: &ClientCache<C>,
        service: &ServiceOffering,
        build: impl FnOnce(DriverChannel) -> Arc<C>,
    ) -> Result<Arc<C>> {
        // Clone the cell out so no map guard is held across the dial
        let cell = cache.entry(service.id.clone()).or_default().clone();

        let client = cell
            .get_or_try_init(move || async move {
                debug!(
                    service_id = %service.id,
                    address = %service.connection_address,
                    "Connecting to driver"
                );
                let channel = self.connector.connect(&service.connection_address).await?;
                Ok::<_, Error>(build(channel))
            })
            .await?;

        Ok(client.clone())
    }
}

fn cached<C: ?Sized>(cache: &ClientCache<C>, service_id: &str) -> Option<Arc<C>> {
    cache.get(service_id).and_then(|cell| cell.get().cloned())
}
