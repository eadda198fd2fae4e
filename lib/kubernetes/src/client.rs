use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::trace;

use super::config::{self, Auth, Config};
use super::resource::{ApiResource, ApiResourceList, DynamicObject, discovery_path};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(config::Error),
    #[error("build http request failed, {0}")]
    BuildRequest(http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("invalid request, {0}")]
    Validation(String),
    #[error("api server error, code: {}, reason: {}, Message: {}", .0.code, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("serialize request failed, {0}")]
    Serialize(serde_json::Error),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),
    #[error("chunk line is too large")]
    LinesCodecMaxLineLengthExceeded,
    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),
}

impl Error {
    /// The HTTP status code reported by the API server, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Api(resp) => Some(resp.code),
            _ => None,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::ReadResponse(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::BuildRequest(err)
    }
}

/// An error response from the API, a `Status` object.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorResponse {
    /// The status
    #[serde(default)]
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    #[serde(default)]
    pub code: u16,
}

/// Common query parameters used in watch calls
#[derive(Debug, Default)]
pub struct WatchParams {
    /// A selector to restrict returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields.
    pub field_selector: Option<String>,

    /// Timeout for the watch call.
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    /// If unset for a watch call, we will use 290s. We limit this to 295s due to
    /// [inherent watch limitations](https://github.com/kubernetes/kubernetes/issues/6513).
    pub timeout: Option<u32>,

    /// Enables watch events with type "BOOKMARK"
    pub bookmarks: bool,
}

impl WatchParams {
    /// Watch a single object by name.
    pub fn object(name: &str) -> Self {
        WatchParams {
            field_selector: Some(format!("metadata.name={name}")),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

/// Can only be relied upon to have metadata with resource version.
///
/// See https://kubernetes.io/docs/reference/using-api/api-concepts/#watch-bookmarks
#[derive(Clone, Debug, Deserialize)]
pub struct Bookmark {
    pub metadata: BookmarkMeta,
}

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Resource bookmark, a slimmed down `K` carrying only the resource version.
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
    default_namespace: String,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, Error> {
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http();
        let mut inner = HttpConnector::new();
        inner.enforce_http(false);
        let connector = builder.enable_http1().wrap_connector(inner);

        let http_client =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let url = config.cluster_url.to_string();
        let endpoint = url.strip_suffix('/').unwrap_or(&url).to_string();

        Ok(Client {
            http_client,
            endpoint,
            auth: config.auth,
            default_namespace: config.default_namespace,
        })
    }

    /// Build a client from kubeconfig or the in-cluster environment.
    pub fn infer() -> Result<Self, Error> {
        let config = Config::load().map_err(Error::Config)?;
        Self::new(config)
    }

    #[inline]
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Fetch the resources served by `api_version`, e.g. `v1` or `apps/v1`
    pub async fn discover(&self, api_version: &str) -> Result<ApiResourceList, Error> {
        let req = self.request(Method::GET, &discovery_path(api_version), None)?;
        self.send(req).await
    }

    pub async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, Error> {
        let path = resource.object_path(namespace, name);
        let req = self.request(Method::GET, &path, None)?;
        self.send(req).await
    }

    /// Create `obj`, the server fills in `name` if only `generateName` is set.
    pub async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let body = serde_json::to_vec(obj).map_err(Error::Serialize)?;
        let req = self.request(Method::POST, &resource.url_path(namespace), Some(body))?;
        self.send(req).await
    }

    /// Replace the named object. If `obj` carries a resource version the
    /// server rejects the update with 409 when it is stale.
    pub async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let body = serde_json::to_vec(obj).map_err(Error::Serialize)?;
        let path = resource.object_path(namespace, name);
        let req = self.request(Method::PUT, &path, Some(body))?;
        self.send(req).await
    }

    /// watch returns a stream the produce WatchEvent, and it will stop if
    /// an error occurred or the connection timeout. So, user have to call this
    /// function again to get notified again.
    ///
    /// An empty `version` starts with synthetic `ADDED` events for the
    /// current state of the matched objects.
    pub async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<DynamicObject>, Error>>, Error> {
        if let Some(timeout) = params.timeout {
            if timeout >= 295 {
                return Err(Error::Validation("invalid timeout limit".into()));
            }
        }

        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());

            if !version.is_empty() {
                builder.append_pair("resourceVersion", version);
            }
            builder.append_pair("watch", "true");
            // https://github.com/kubernetes/kubernetes/issues/6513
            builder.append_pair(
                "timeoutSeconds",
                params.timeout.unwrap_or(290).to_string().as_str(),
            );

            if let Some(label_selector) = params.label_selector.as_ref() {
                builder.append_pair("labelSelector", label_selector);
            }
            if let Some(field_selector) = params.field_selector.as_ref() {
                builder.append_pair("fieldSelector", field_selector);
            }
            if params.bookmarks {
                builder.append_pair("allowWatchBookmarks", "true");
            }

            builder.finish()
        };
        let path = format!("{}?{}", resource.url_path(namespace), query);

        trace!(message = "doing watch request", path);

        let req = self.request(Method::GET, &path, None)?;
        self.request_events(req).await
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Request<Full<Bytes>>, Error> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.endpoint, path))
            .header(header::ACCEPT, "application/json");

        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(body))
            }
            None => Full::default(),
        };

        let mut req = builder.body(body)?;
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        Ok(req)
    }

    async fn send<T: DeserializeOwned>(&self, req: Request<Full<Bytes>>) -> Result<T, Error> {
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();

        if parts.status.is_success() {
            return serde_json::from_slice(&body).map_err(Error::Deserialize);
        }

        Err(Error::Api(error_response(parts.status, &body)))
    }

    async fn request_events(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<BoxStream<'static, Result<WatchEvent<DynamicObject>, Error>>, Error> {
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;

        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            let body = incoming.collect().await?.to_bytes();
            return Err(Error::Api(error_response(parts.status, &body)));
        }

        let frames = FramedRead::new(
            StreamReader::new(incoming.into_data_stream().map_err(|err| {
                // Unexpected EOF from chunked decoder.
                // Tends to happen when watching for 300+s. This will be ignored
                if err.to_string().contains("unexpected EOF during check") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err);
                }

                std::io::Error::other(err)
            })),
            LinesCodec::new(),
        );

        Ok(Box::pin(frames.filter_map(|result| async {
            match result {
                Ok(line) => decode_event(&line),
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    // Client timeout
                    std::io::ErrorKind::TimedOut => {
                        tracing::warn!("timeout in poll: {}", err);
                        None
                    }
                    // Unexpected EOF from chunked decoder.
                    // Tends to happen after 300+s of watching.
                    std::io::ErrorKind::UnexpectedEof => {
                        tracing::warn!("eof in poll: {}", err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },

                // Reached the maximum line length without finding a newline.
                // This should never happen because we're using the default `usize::MAX`.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Some(Err(Error::LinesCodecMaxLineLengthExceeded))
                }
            }
        })))
    }
}

/// Decode a `Status` body. Not every failure carries one, proxies in between
/// answer with plain text.
fn error_response(status: StatusCode, body: &[u8]) -> ErrorResponse {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(resp) if resp.code != 0 => resp,
        _ => ErrorResponse {
            status: "Failure".into(),
            message: String::from_utf8_lossy(body).into_owned(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            code: status.as_u16(),
        },
    }
}

fn decode_event(line: &str) -> Option<Result<WatchEvent<DynamicObject>, Error>> {
    match serde_json::from_str::<WatchEvent<DynamicObject>>(line) {
        Ok(event) => Some(Ok(event)),
        Err(err) => {
            // Ignore EOF error that can happen for incomplete line from `decode_eof`.
            if err.is_eof() {
                return None;
            }

            // Got general error response
            if let Ok(resp) = serde_json::from_str::<ErrorResponse>(line) {
                return Some(Err(Error::Api(resp)));
            }

            Some(Err(Error::Deserialize(err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_events() {
        let line = r#"{"type":"MODIFIED","object":{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings","resourceVersion":"7"},"data":{"a":"b"}}}"#;
        match decode_event(line) {
            Some(Ok(WatchEvent::Modified(obj))) => {
                assert_eq!(obj.name(), Some("settings"));
                assert_eq!(obj.resource_version(), Some("7"));
            }
            _ => panic!("expect modified event"),
        }

        let line = r#"{"type":"BOOKMARK","object":{"kind":"ConfigMap","apiVersion":"v1","metadata":{"resourceVersion":"12"}}}"#;
        match decode_event(line) {
            Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                assert_eq!(bookmark.metadata.resource_version, "12")
            }
            _ => panic!("expect bookmark event"),
        }

        let line = r#"{"type":"ERROR","object":{"kind":"Status","apiVersion":"v1","status":"Failure","message":"too old resource version: 1 (5)","reason":"Expired","code":410}}"#;
        match decode_event(line) {
            Some(Ok(WatchEvent::Error(resp))) => {
                assert_eq!(resp.code, 410);
                assert_eq!(resp.reason, "Expired");
            }
            _ => panic!("expect error event"),
        }

        // truncated line at the end of the stream
        assert!(decode_event(r#"{"type":"ADDED","object":{"#).is_none());
    }

    #[test]
    fn api_error_message() {
        let err = Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "configmaps \"settings\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });

        assert_eq!(err.code(), Some(404));
        assert_eq!(
            err.to_string(),
            "api server error, code: 404, reason: NotFound, Message: configmaps \"settings\" not found"
        );
    }

    #[test]
    fn plain_text_errors() {
        let resp = error_response(StatusCode::BAD_GATEWAY, b"upstream connect error");
        assert_eq!(resp.code, 502);
        assert_eq!(resp.reason, "Bad Gateway");
        assert_eq!(resp.message, "upstream connect error");

        let body = br#"{"kind":"Status","status":"Failure","message":"forbidden","reason":"Forbidden","code":403}"#;
        let resp = error_response(StatusCode::FORBIDDEN, body);
        assert_eq!(resp.message, "forbidden");
        assert_eq!(resp.code, 403);
    }

    #[test]
    fn watch_params() {
        let params = WatchParams::object("settings");
        assert_eq!(params.field_selector.as_deref(), Some("metadata.name=settings"));
        assert!(!params.bookmarks);
    }
}
