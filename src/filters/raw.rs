use crate::context::{Context, FilterArgs};
use crate::errors::Result;
use crate::pipeline::{Filter, ResponseFilter, Role};
use crate::response::Response;
use std::sync::Arc;

/// Writes status, headers and body to the client as received.
#[derive(Debug, Default)]
pub struct RawResponseFilter;

impl Filter for RawResponseFilter {
  fn name(&self) -> &'static str {
    "RAW"
  }
  fn roles(self: Arc<Self>) -> Vec<Role> {
    vec![Role::Response(self)]
  }
}

#[async_trait::async_trait]
impl ResponseFilter for RawResponseFilter {
  async fn filter(&self, _ctx: &mut Context, _resp: &Response) -> Result<Option<FilterArgs>> {
    Ok(None)
  }

  async fn handle_response(
    &self,
    ctx: &mut Context,
    _args: Option<FilterArgs>,
    mut resp: Response,
  ) -> Result<()> {
    resp.prepare_for_client();
    ctx.writer_mut().write_response(&resp).await
  }
}
