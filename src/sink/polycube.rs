use super::{Chain, ChainRule, Error, Result, RuleAction, RuleSink};
use log::debug;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://127.0.0.1:9000/polycube/v1";

/// REST client of the local polycube daemon's firewall service.
#[derive(Clone)]
pub struct Polycube {
    client: Client,
    base: String,
}

impl Polycube {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chain_path(name: &str, chain: Chain) -> String {
        format!("firewall/{name}/chain/{chain}")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> Result<(StatusCode, String)> {
        let url = format!("{}/{path}/", self.base);
        debug!("{method} {url}");

        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        Ok((status, text))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> Result<String> {
        let (status, text) = self.send(method.clone(), path, body).await?;
        if !status.is_success() {
            return Err(Error::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

const NO_BODY: Option<&()> = None;

impl RuleSink for Polycube {
    async fn create_firewall(&self, name: &str) -> Result<()> {
        let path = format!("firewall/{name}");
        self.call(Method::POST, &path, Some(&json!({ "name": name })))
            .await?;
        // rules only reach the data plane through apply-rules
        let path = format!("firewall/{name}/interactive");
        self.call(Method::PATCH, &path, Some(&false)).await?;
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("firewall/{name}"), NO_BODY)
            .await?;
        Ok(())
    }

    async fn firewall_exists(&self, name: &str) -> Result<bool> {
        let path = format!("firewall/{name}/uuid");
        let (status, body) = self.send(Method::GET, &path, NO_BODY).await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::Status {
                method: "GET".into(),
                path,
                status: s.as_u16(),
                body,
            }),
        }
    }

    async fn read_chain(&self, name: &str, chain: Chain) -> Result<Vec<ChainRule>> {
        let path = format!("{}/rule", Self::chain_path(name, chain));
        let body = self.call(Method::GET, &path, NO_BODY).await?;
        if body.trim().is_empty() {
            return Ok(vec![]);
        }
        serde_json::from_str(&body).map_err(|source| Error::Decode { path, source })
    }

    async fn append_rules(&self, name: &str, chain: Chain, rules: &[ChainRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let path = format!("{}/rule", Self::chain_path(name, chain));
        self.call(Method::POST, &path, Some(rules)).await?;
        Ok(())
    }

    async fn delete_rule(&self, name: &str, chain: Chain, id: u32) -> Result<()> {
        let path = format!("{}/rule/{id}", Self::chain_path(name, chain));
        self.call(Method::DELETE, &path, NO_BODY).await?;
        Ok(())
    }

    async fn set_default_action(&self, name: &str, chain: Chain, action: RuleAction) -> Result<()> {
        let path = format!("{}/default", Self::chain_path(name, chain));
        self.call(Method::PATCH, &path, Some(&action)).await?;
        Ok(())
    }

    async fn apply_rules(&self, name: &str, chain: Chain) -> Result<()> {
        let path = format!("{}/apply-rules", Self::chain_path(name, chain));
        self.call(Method::POST, &path, NO_BODY).await?;
        Ok(())
    }
}
