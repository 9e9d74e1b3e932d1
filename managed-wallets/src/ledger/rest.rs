//! [`Ledger`] backed by a BitGo Express compatible REST API.

use super::{
    Ledger, SendMany, SendResult, Sweep, UnspentPage, Wallet, WalletAddress, WalletPage,
};
use crate::unspent::ChainCode;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bitcoin::Amount;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, Debug)]
pub struct RestLedger {
    client: Client,
    base_url: Url,
    coin: String,
    access_token: String,
}

impl RestLedger {
    /// `base_url` should end with a `/` if it carries a path.
    pub fn new(base_url: Url, coin: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("managed-wallets/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            coin: coin.into(),
            access_token: access_token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let path = format!("api/v2/{}/{}", self.coin, path);
        self.base_url
            .join(&path)
            .with_context(|| format!("Invalid ledger path {}", path))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.url(path)?)
            .bearer_auth(&self.access_token))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.context("Failed to reach ledger")?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ledger responded with {}: {}", status, body);
        }

        Ok(response)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .context("Failed to deserialize ledger response")
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.send(self.request(Method::GET, path)?.query(query)).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    fn wallet(&self, data: WalletData) -> Result<RestWallet> {
        let receive_address = data
            .receive_address
            .map(|receive| receive.address)
            .with_context(|| format!("Wallet {} has no receive address", data.id))?;

        Ok(RestWallet {
            ledger: self.clone(),
            id: data.id,
            label: data.label,
            balance: data.balance,
            spendable_balance: data.spendable_balance,
            receive_address,
        })
    }
}

fn page_query(prev_id: Option<String>, limit: usize) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(prev_id) = prev_id {
        query.push(("prevId", prev_id));
    }
    query
}

#[derive(Deserialize)]
struct BlockHeader {
    height: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletData {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default, with = "bitcoin::amount::serde::as_sat")]
    balance: Amount,
    #[serde(default, with = "bitcoin::amount::serde::as_sat")]
    spendable_balance: Amount,
    #[serde(default)]
    receive_address: Option<ReceiveAddress>,
}

#[derive(Deserialize)]
struct ReceiveAddress {
    address: String,
}

#[derive(Deserialize)]
struct GeneratedWallet {
    wallet: WalletData,
}

#[derive(Deserialize)]
struct AddressList {
    addresses: Vec<WalletAddress>,
}

#[derive(Serialize)]
struct GenerateWallet<'a> {
    label: &'a str,
    passphrase: &'a str,
}

#[derive(Serialize)]
struct Rename<'a> {
    label: &'a str,
}

#[derive(Serialize)]
struct CreateAddress {
    chain: ChainCode,
}

#[async_trait]
impl Ledger for RestLedger {
    type Wallet = RestWallet;

    async fn chain_head(&self) -> Result<u32> {
        let header: BlockHeader = self.get("public/block/latest", &[]).await?;
        Ok(header.height)
    }

    async fn list_wallets(&self, prev_id: Option<String>, limit: usize) -> Result<WalletPage> {
        self.get("wallet", &page_query(prev_id, limit)).await
    }

    async fn get_wallet(&self, id: &str) -> Result<RestWallet> {
        let data = self.get(&format!("wallet/{}", id), &[]).await?;
        self.wallet(data)
    }

    async fn generate_wallet(&self, label: &str, passphrase: &str) -> Result<RestWallet> {
        let generated: GeneratedWallet = self
            .post("wallet/generate", &GenerateWallet { label, passphrase })
            .await?;
        self.wallet(generated.wallet)
    }

    async fn rename_wallet(&self, id: &str, label: &str) -> Result<()> {
        let request = self
            .request(Method::PUT, &format!("wallet/{}", id))?
            .json(&Rename { label });
        self.execute(request).await?;
        Ok(())
    }

    async fn remove_wallet(&self, id: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &format!("wallet/{}", id))?;
        self.execute(request).await?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RestWallet {
    ledger: RestLedger,
    id: String,
    label: String,
    balance: Amount,
    spendable_balance: Amount,
    receive_address: String,
}

impl RestWallet {
    fn path(&self, action: &str) -> String {
        format!("wallet/{}/{}", self.id, action)
    }
}

#[async_trait]
impl Wallet for RestWallet {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn balance(&self) -> Amount {
        self.balance
    }

    fn spendable_balance(&self) -> Amount {
        self.spendable_balance
    }

    fn receive_address(&self) -> &str {
        &self.receive_address
    }

    async fn create_address(&self, chain: ChainCode) -> Result<WalletAddress> {
        self.ledger
            .post(&self.path("address"), &CreateAddress { chain })
            .await
    }

    async fn unspents(&self, prev_id: Option<String>, limit: usize) -> Result<UnspentPage> {
        self.ledger
            .get(&self.path("unspents"), &page_query(prev_id, limit))
            .await
    }

    async fn addresses(&self, limit: usize) -> Result<Vec<WalletAddress>> {
        let list: AddressList = self
            .ledger
            .get(&self.path("addresses"), &[("limit", limit.to_string())])
            .await?;
        Ok(list.addresses)
    }

    async fn send_many(&self, request: SendMany) -> Result<SendResult> {
        self.ledger.post(&self.path("sendmany"), &request).await
    }

    async fn sweep(&self, request: Sweep) -> Result<SendResult> {
        self.ledger.post(&self.path("sweep"), &request).await
    }
}
