use anyhow::Result;
use rand::seq::SliceRandom;

use super::config::ProbeTarget;
use crate::engine::workload::{VuContext, Workload};

/// `GET base_url + path` once per iteration, judged by status code.
pub struct HttpProbe {
    client: reqwest::blocking::Client,
    url: String,
    tag: String,
    expect_status: u16,
    check_name: String,
    query: Vec<(String, Vec<String>)>,
}

impl HttpProbe {
    pub fn new(target: &ProbeTarget) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(target.timeout)
            .user_agent(concat!("barrage/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: target.url(),
            tag: target.path.clone(),
            expect_status: target.expect_status,
            check_name: format!("status is {}", target.expect_status),
            query: target.query.clone(),
        })
    }

    fn pick_query(&self, ctx: &mut VuContext) -> Vec<(String, String)> {
        self.query
            .iter()
            .filter_map(|(param, values)| {
                values
                    .choose(ctx.rng())
                    .map(|v| (param.clone(), v.clone()))
            })
            .collect()
    }
}

impl Workload for HttpProbe {
    type Output = u16;

    fn name(&self) -> &str {
        &self.tag
    }

    fn execute(&self, ctx: &mut VuContext) -> Result<u16> {
        let mut request = self.client.get(&self.url);
        let query = self.pick_query(ctx);
        if !query.is_empty() {
            request = request.query(&query);
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        // read the body so the timing covers the full response
        response.bytes()?;
        Ok(status)
    }

    fn check(&self, status: &u16) -> bool {
        *status == self.expect_status
    }

    fn check_name(&self) -> &str {
        &self.check_name
    }
}
