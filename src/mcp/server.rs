/// MCP server using `rmcp` with stdio transport.
///
/// [`DocServer`] adapts the [`Dispatcher`] to rmcp's `ServerHandler`; rmcp
/// owns the framing, request ids and concurrency.
use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::model::*;
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceExt, transport::io::stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::tools::ToolDescriptor;
use crate::config::ServerMode;

#[derive(Clone)]
pub struct DocServer {
    dispatcher: Arc<Dispatcher>,
}

impl DocServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn to_mcp_tool(descriptor: ToolDescriptor) -> Tool {
    let schema = match descriptor.input_schema {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(descriptor.name, descriptor.description, Arc::new(schema))
}

impl ServerHandler for DocServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = match self.dispatcher.mode() {
            ServerMode::Rag => {
                "Document server over a local file tree. Files are exposed as resources; \
                 use rag_search / rag_ask for retrieval over the index and \
                 reindex_documents to refresh it."
            }
            ServerMode::Basic => {
                "Document server over a local file tree. Files are exposed as resources; \
                 use search_files to find them and ask_ai / analyze_file for AI help."
            }
        };
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(instructions.to_string()),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools = self.dispatcher.tools().into_iter().map(to_mcp_tool).collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);
        let value = self.dispatcher.call_tool(&request.name, arguments).await?;
        Ok(CallToolResult::structured(value))
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources = self
            .dispatcher
            .list_resources()
            .await?
            .into_iter()
            .map(|entry| {
                let mut raw = RawResource::new(entry.uri, entry.name);
                raw.mime_type = Some(entry.mime_type);
                raw.no_annotation()
            })
            .collect();
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let read = self.dispatcher.read_resource(&request.uri).await?;
        let mut contents = ResourceContents::text(read.text, read.uri);
        if let ResourceContents::TextResourceContents { mime_type, .. } = &mut contents {
            *mime_type = Some(read.mime_type);
        }
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }
}

/// Serve over `reader`/`writer` until the client disconnects or `shutdown`
/// fires.
pub async fn serve<R, W>(
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let running = DocServer::new(dispatcher)
        .serve((reader, writer))
        .await
        .context("MCP initialization failed")?;

    let cancel = running.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutdown requested, closing MCP session");
        cancel.cancel();
    });

    let reason = running.waiting().await;
    watcher.abort();
    let reason = reason.context("MCP session task failed")?;
    info!("MCP session ended: {reason:?}");
    Ok(())
}

/// Serve on the process's stdin/stdout.
pub async fn serve_stdio(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Result<()> {
    info!("Starting MCP server on stdio (mode: {:?})", dispatcher.mode());
    let (stdin, stdout) = stdio();
    serve(dispatcher, stdin, stdout, shutdown)
        .await
        .context("MCP Server encountered an error during stdio transport")
}
