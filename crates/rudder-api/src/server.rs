//! The resource service: Get/List/Watch over the store, served on the node
//! daemon's UNIX socket (and reachable from outside through the router).

use std::path::PathBuf;

use rudder_proto::resource::resource_service_server::{ResourceService, ResourceServiceServer};
use rudder_proto::resource::{
    EventType, Get, GetRequest, GetResponse, ListRequest, ListResponse, WatchRequest,
    WatchResponse,
};
use rudder_state::resources::meta;
use rudder_state::{EventKind, Query, Resource, State};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::debug;

/// gRPC server over the resource store.
pub struct ResourceServer {
    state: State,
}

impl ResourceServer {
    pub fn new(state: State) -> Self {
        ResourceServer { state }
    }

    pub fn into_service(self) -> ResourceServiceServer<Self> {
        ResourceServiceServer::new(self)
    }

    /// Resolves a user-supplied type name through the definition table: the
    /// definition id, the canonical type and any alias all match. An empty
    /// namespace falls back to the definition's default.
    async fn resolve_resource_kind(
        &self,
        namespace: &str,
        ty: &str,
    ) -> Result<ResolvedKind, Status> {
        let definitions = self
            .state
            .list(meta::NAMESPACE, meta::RESOURCE_DEFINITION_TYPE)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        for definition in definitions {
            let spec = definition
                .spec()
                .as_resource_definition()
                .ok_or_else(|| Status::internal("unexpected spec on resource definition"))?;

            let matches = definition.metadata().id() == ty
                || spec.ty == ty
                || spec.aliases.iter().any(|alias| alias == ty);

            if !matches {
                continue;
            }

            let namespace = if namespace.is_empty() {
                spec.default_namespace.clone()
            } else {
                namespace.to_string()
            };
            let ty = spec.ty.clone();

            return Ok(ResolvedKind {
                definition,
                namespace,
                ty,
            });
        }

        Err(Status::not_found(format!("resource {:?} is not registered", ty)))
    }

    async fn check_read_access(&self, namespace: &str) -> Result<(), Status> {
        let namespaces = self
            .state
            .list(meta::NAMESPACE, meta::NAMESPACE_TYPE)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        if namespaces.iter().any(|ns| ns.metadata().id() == namespace) {
            return Ok(());
        }

        Err(Status::not_found(format!(
            "namespace {:?} is not registered",
            namespace
        )))
    }
}

struct ResolvedKind {
    definition: Resource,
    namespace: String,
    ty: String,
}

fn marshal_resource(resource: &Resource) -> Result<rudder_proto::resource::Resource, Status> {
    let yaml = resource
        .spec()
        .to_yaml()
        .map_err(|err| Status::internal(format!("error serializing spec: {}", err)))?;

    Ok(rudder_proto::resource::Resource {
        metadata: Some(rudder_proto::resource::Metadata {
            namespace: resource.metadata().namespace().to_string(),
            r#type: resource.metadata().ty().to_string(),
            id: resource.metadata().id().to_string(),
            version: resource.metadata().version().to_string(),
            phase: resource.metadata().phase().to_string(),
            finalizers: resource
                .metadata()
                .finalizers()
                .iter()
                .map(str::to_string)
                .collect(),
        }),
        spec: Some(rudder_proto::resource::Spec {
            yaml: yaml.into_bytes(),
        }),
    })
}

fn event_type(kind: EventKind) -> EventType {
    match kind {
        EventKind::Bootstrap => EventType::Bootstrapped,
        EventKind::Created => EventType::Created,
        EventKind::Updated => EventType::Updated,
        EventKind::Destroyed => EventType::Destroyed,
    }
}

#[tonic::async_trait]
impl ResourceService for ResourceServer {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let request = request.into_inner();

        let kind = self
            .resolve_resource_kind(&request.namespace, &request.r#type)
            .await?;
        self.check_read_access(&kind.namespace).await?;

        let resource = match self.state.get(&kind.namespace, &kind.ty, &request.id).await {
            Ok(resource) => resource,
            Err(err) if err.is_not_found() => return Err(Status::not_found(err.to_string())),
            Err(err) => return Err(Status::internal(err.to_string())),
        };

        Ok(Response::new(GetResponse {
            messages: vec![Get {
                metadata: None,
                definition: Some(marshal_resource(&kind.definition)?),
                resource: Some(marshal_resource(&resource)?),
            }],
        }))
    }

    type ListStream = ReceiverStream<Result<ListResponse, Status>>;

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let request = request.into_inner();

        let kind = self
            .resolve_resource_kind(&request.namespace, &request.r#type)
            .await?;
        self.check_read_access(&kind.namespace).await?;

        let resources = self
            .state
            .list(&kind.namespace, &kind.ty)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        // The definition goes out first so clients know how to render what
        // follows.
        let mut frames = Vec::with_capacity(resources.len() + 1);
        frames.push(ListResponse {
            metadata: None,
            definition: Some(marshal_resource(&kind.definition)?),
            resource: None,
        });

        for resource in &resources {
            frames.push(ListResponse {
                metadata: None,
                definition: None,
                resource: Some(marshal_resource(resource)?),
            });
        }

        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    // Client closed the stream.
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let request = request.into_inner();

        let kind = self
            .resolve_resource_kind(&request.namespace, &request.r#type)
            .await?;
        self.check_read_access(&kind.namespace).await?;

        let query = if request.id.is_empty() {
            Query::kind(&kind.namespace, &kind.ty)
        } else {
            Query::exact(&kind.namespace, &kind.ty, &request.id)
        };

        let mut events = self
            .state
            .watch(query)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let frame = marshal_resource(&event.resource).map(|resource| WatchResponse {
                    metadata: None,
                    event_type: event_type(event.kind) as i32,
                    resource: Some(resource),
                });

                let closed = match frame {
                    Ok(frame) => tx.send(Ok(frame)).await.is_err(),
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        true
                    }
                };

                if closed {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Serves the resource API on a UNIX socket until `shutdown` fires.
pub async fn serve(
    state: State,
    socket: PathBuf,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(parent) = socket.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // A socket left behind by a previous run would fail the bind.
    match tokio::fs::remove_file(&socket).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let listener = tokio::net::UnixListener::bind(&socket)?;

    debug!(socket = %socket.display(), "serving resource API");

    tonic::transport::Server::builder()
        .add_service(ResourceServer::new(state).into_service())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown.cancelled())
        .await?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rudder_state::registry;
    use rudder_state::resources::config;

    async fn new_server() -> ResourceServer {
        let state = State::new();
        registry::register_defaults(&state).await.unwrap();
        state
            .create(config::new_machine_type(config::MachineType::ControlPlane))
            .await
            .unwrap();

        ResourceServer::new(state)
    }

    #[tokio::test]
    async fn get_resolves_aliases_and_default_namespace() {
        let server = new_server().await;

        let response = server
            .get(Request::new(GetRequest {
                namespace: String::new(),
                r#type: "machineType".to_string(),
                id: config::MACHINE_TYPE_ID.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.messages.len(), 1);
        let message = &response.messages[0];

        let definition = message.definition.as_ref().unwrap();
        assert_eq!(
            definition.metadata.as_ref().unwrap().id,
            config::MACHINE_TYPE_TYPE
        );

        let resource = message.resource.as_ref().unwrap();
        let metadata = resource.metadata.as_ref().unwrap();
        assert_eq!(metadata.namespace, config::NAMESPACE);
        assert_eq!(metadata.r#type, config::MACHINE_TYPE_TYPE);
        assert_eq!(metadata.phase, "running");
        assert_eq!(
            String::from_utf8(resource.spec.as_ref().unwrap().yaml.clone()).unwrap(),
            "controlplane\n"
        );
    }

    #[tokio::test]
    async fn get_unknown_type_is_not_found() {
        let server = new_server().await;

        let status = server
            .get(Request::new(GetRequest {
                namespace: String::new(),
                r#type: "noSuchType".to_string(),
                id: "x".to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn get_unregistered_namespace_is_not_found() {
        let server = new_server().await;

        let status = server
            .get(Request::new(GetRequest {
                namespace: "nowhere".to_string(),
                r#type: "machineType".to_string(),
                id: config::MACHINE_TYPE_ID.to_string(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn list_streams_definition_then_resources() {
        let server = new_server().await;

        let mut stream = server
            .list(Request::new(ListRequest {
                namespace: String::new(),
                r#type: "machineType".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .into_inner();

        let first = stream.recv().await.unwrap().unwrap();
        assert!(first.definition.is_some());
        assert!(first.resource.is_none());

        let second = stream.recv().await.unwrap().unwrap();
        assert!(second.definition.is_none());
        assert_eq!(
            second.resource.unwrap().metadata.unwrap().id,
            config::MACHINE_TYPE_ID
        );

        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn watch_streams_bootstrap_then_live_events() {
        let state = State::new();
        registry::register_defaults(&state).await.unwrap();
        state
            .create(config::new_machine_type(config::MachineType::Worker))
            .await
            .unwrap();

        let server = ResourceServer::new(state.clone());

        let mut stream = server
            .watch(Request::new(WatchRequest {
                namespace: String::new(),
                r#type: "machineType".to_string(),
                id: String::new(),
            }))
            .await
            .unwrap()
            .into_inner()
            .into_inner();

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.event_type, EventType::Bootstrapped as i32);

        state
            .modify(config::new_machine_type(config::MachineType::ControlPlane))
            .await
            .unwrap();

        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second.event_type, EventType::Updated as i32);
    }
}
