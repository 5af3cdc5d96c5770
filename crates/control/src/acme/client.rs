//! The ACME v2 protocol client.
//!
//! Drives the full issuance flow against any RFC 8555 provider: account
//! creation, order placement, the authorization/challenge sub-flow for
//! HTTP-01 and DNS-01, CSR finalization, and certificate download.
//!
//! Operational behavior:
//! - directory documents are cached for 6.5 hours per provider
//! - nonces are pooled per provider from every `Replay-Nonce` header; an
//!   empty pool is refilled with a HEAD against `newNonce`
//! - a `badNonce` problem is retried exactly once, re-signed with a
//!   freshly fetched nonce
//! - a `rateLimited` problem marks the provider unavailable until
//!   `Retry-After` (or 1 hour) elapses; requests fail fast until then

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bastion_common::{AccountId, ExpiringCache, NonceCache};
use bastion_config::{AccountRepository, AcmeAccount, AcmeHost, ChallengeKind};

use super::error::{AcmeError, AcmeProblem};
use super::http01::ChallengeMap;
use super::jws::AccountKey;
use super::wire::{
    Authorization, Directory, FinalizeRequest, Identifier, NewAccountRequest, NewOrderRequest,
    Order, OrderStatus,
};
use crate::blob::BlobStore;
use crate::certs::material::CertificateMaterial;
use crate::dns::ProviderRegistry;

/// Directory documents are refetched after this long.
const DIRECTORY_TTL: Duration = Duration::from_secs(6 * 3600 + 1800);
/// Order and authorization poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Overall deadline for one order attempt.
const ORDER_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// How long to wait for the HTTP-01 responder to report delivery.
const HTTP01_DELIVERY_WAIT: Duration = Duration::from_secs(2 * 60);

/// A configured ACME provider (directory endpoint plus policy).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub directory_url: String,
    /// Whether accounts may be created without contact emails.
    #[serde(default)]
    pub contact_emails_optional: bool,
}

/// ACME v2 client, shared across all accounts and providers.
pub struct AcmeClient {
    http: reqwest::Client,
    providers: HashMap<String, ProviderConfig>,
    directories: ExpiringCache<String, Arc<Directory>>,
    /// Per-provider FIFO pool of single-use nonces.
    nonces: NonceCache<String, String>,
    /// Per-provider backoff expiry after a `rateLimited` problem.
    rate_limited_until: Mutex<HashMap<String, DateTime<Utc>>>,
    accounts: Arc<dyn AccountRepository>,
    blobs: Arc<dyn BlobStore>,
    challenges: Arc<ChallengeMap>,
    dns: Arc<ProviderRegistry>,
}

impl AcmeClient {
    pub fn new(
        providers: Vec<ProviderConfig>,
        accounts: Arc<dyn AccountRepository>,
        blobs: Arc<dyn BlobStore>,
        challenges: Arc<ChallengeMap>,
        dns: Arc<ProviderRegistry>,
    ) -> Result<Self, AcmeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            providers: providers.into_iter().map(|p| (p.id.clone(), p)).collect(),
            directories: ExpiringCache::new(),
            nonces: NonceCache::new(),
            rate_limited_until: Mutex::new(HashMap::new()),
            accounts,
            blobs,
            challenges,
            dns,
        })
    }

    /// The pending-challenge map the HTTP layer serves from.
    pub fn challenge_map(&self) -> Arc<ChallengeMap> {
        Arc::clone(&self.challenges)
    }

    fn provider(&self, id: &str) -> Result<&ProviderConfig, AcmeError> {
        self.providers
            .get(id)
            .ok_or_else(|| AcmeError::UnknownProvider(id.to_string()))
    }

    // ---- directory and nonce management ----

    /// Fetch (or return the cached) directory document for a provider.
    pub async fn directory(&self, provider_id: &str) -> Result<Arc<Directory>, AcmeError> {
        self.check_rate_limit(provider_id)?;
        if let Some(cached) = self.directories.get(&provider_id.to_string()) {
            return Ok(cached);
        }

        let provider = self.provider(provider_id)?;
        debug!(provider = provider_id, url = %provider.directory_url, "fetching ACME directory");
        let response = self.http.get(&provider.directory_url).send().await?;
        self.record_nonce(provider_id, response.headers());
        let response = response.error_for_status()?;
        let directory: Arc<Directory> = Arc::new(response.json().await?);

        self.directories
            .insert(provider_id.to_string(), Arc::clone(&directory), DIRECTORY_TTL);
        Ok(directory)
    }

    /// Stash a `Replay-Nonce` header into the provider's pool.
    fn record_nonce(&self, provider_id: &str, headers: &reqwest::header::HeaderMap) {
        if let Some(nonce) = headers
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
        {
            self.nonces.push(provider_id.to_string(), nonce.to_string());
        }
    }

    /// Pop a pooled nonce, or fetch one with a dedicated HEAD request.
    async fn take_nonce(
        &self,
        provider_id: &str,
        directory: &Directory,
    ) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonces.take(&provider_id.to_string()) {
            return Ok(nonce);
        }
        let response = self.http.head(&directory.new_nonce).send().await?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Wire("newNonce returned no Replay-Nonce header".into()))
    }

    // ---- rate limiting ----

    fn check_rate_limit(&self, provider_id: &str) -> Result<(), AcmeError> {
        if let Some(until) = self.rate_limited_until.lock().get(provider_id) {
            if *until > Utc::now() {
                return Err(AcmeError::RateLimited {
                    provider: provider_id.to_string(),
                    until: *until,
                });
            }
        }
        Ok(())
    }

    fn mark_rate_limited(
        &self,
        provider_id: &str,
        headers: &reqwest::header::HeaderMap,
    ) -> AcmeError {
        let backoff = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(ChronoDuration::seconds)
            // absent or unparsable Retry-After backs off a full hour
            .unwrap_or_else(|| ChronoDuration::hours(1));
        let until = Utc::now() + backoff;
        warn!(provider = provider_id, %until, "ACME provider rate-limited");
        self.rate_limited_until
            .lock()
            .insert(provider_id.to_string(), until);
        AcmeError::RateLimited {
            provider: provider_id.to_string(),
            until,
        }
    }

    // ---- signed requests ----

    /// Send one signed POST, transparently retrying a `badNonce` rejection
    /// exactly once with a freshly fetched nonce and a fresh signature.
    async fn post<P: Serialize>(
        &self,
        provider_id: &str,
        directory: &Directory,
        key: &AccountKey,
        kid: Option<&str>,
        url: &str,
        payload: Option<&P>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, AcmeError> {
        self.check_rate_limit(provider_id)?;

        let mut retried = false;
        loop {
            let nonce = self.take_nonce(provider_id, directory).await?;
            let body = key.sign_jws(url, &nonce, kid, payload)?;

            let send = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
                .body(body)
                .send();
            let response = tokio::select! {
                response = send => response?,
                _ = cancel.cancelled() => return Err(AcmeError::Canceled),
            };
            self.record_nonce(provider_id, response.headers());

            if response.status().is_success() {
                return Ok(response);
            }

            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.bytes().await?;
            let problem: AcmeProblem = match serde_json::from_slice(&bytes) {
                Ok(problem) => problem,
                Err(_) => {
                    return Err(AcmeError::Wire(format!(
                        "HTTP {status} with non-problem body from {url}"
                    )))
                }
            };

            if problem.is_bad_nonce() && !retried {
                debug!(url, "badNonce, retrying once with a fresh nonce");
                retried = true;
                continue;
            }
            if problem.is_rate_limited() {
                return Err(self.mark_rate_limited(provider_id, &headers));
            }
            return Err(AcmeError::Problem(problem));
        }
    }

    /// POST-as-GET a resource and decode its JSON body.
    async fn post_as_get<T: serde::de::DeserializeOwned>(
        &self,
        provider_id: &str,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, AcmeError> {
        let response = self
            .post::<()>(provider_id, directory, key, Some(kid), url, None, cancel)
            .await?;
        Ok(response.json().await?)
    }

    // ---- accounts ----

    /// Create an account with the provider and persist it.
    ///
    /// The account key is generated first but only written to the blob
    /// store after the provider returns an account URL; a response without
    /// a `Location` header leaves no trace on disk.
    pub async fn create_account(
        &self,
        name: &str,
        provider_id: &str,
        contact_emails: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<AcmeAccount, AcmeError> {
        let provider = self.provider(provider_id)?;
        if contact_emails.is_empty() && !provider.contact_emails_optional {
            return Err(AcmeError::ContactRequired(provider_id.to_string()));
        }

        let directory = self.directory(provider_id).await?;
        let key = AccountKey::generate()?;
        let request = NewAccountRequest {
            terms_of_service_agreed: true,
            contact: contact_emails
                .iter()
                .map(|email| format!("mailto:{email}"))
                .collect(),
        };

        let response = self
            .post(
                provider_id,
                &directory,
                &key,
                None,
                &directory.new_account,
                Some(&request),
                cancel,
            )
            .await?;

        let account_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(AcmeError::MissingAccountUrl)?;

        let account = AcmeAccount {
            id: AccountId::new(),
            name: name.to_string(),
            provider_id: provider_id.to_string(),
            directory_account_url: account_url,
            contact_emails,
        };
        self.blobs
            .write(&account_key_blob(account.id), key.pkcs8_der())
            .await?;
        self.accounts.upsert(account.clone()).await?;
        info!(account = %account.id, provider = provider_id, "ACME account created");
        Ok(account)
    }

    /// Delete an account row and its stored key.
    pub async fn purge_account(&self, account_id: AccountId) -> Result<(), AcmeError> {
        self.blobs.delete(&account_key_blob(account_id)).await?;
        self.accounts.delete(account_id).await?;
        info!(account = %account_id, "ACME account purged");
        Ok(())
    }

    async fn load_account(
        &self,
        account_id: AccountId,
    ) -> Result<(AcmeAccount, AccountKey), AcmeError> {
        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or(AcmeError::AccountNotFound(account_id))?;
        let der = self
            .blobs
            .read(&account_key_blob(account_id))
            .await?
            .ok_or(AcmeError::AccountKeyMissing(account_id))?;
        let key = AccountKey::from_pkcs8(&der)?;
        Ok((account, key))
    }

    // ---- orders ----

    /// Run a complete order for `hosts` and return the issued material.
    pub async fn order_certificate(
        &self,
        account_id: AccountId,
        hosts: &[AcmeHost],
        cancel: &CancellationToken,
    ) -> Result<CertificateMaterial, AcmeError> {
        let (account, key) = self.load_account(account_id).await?;
        let provider_id = account.provider_id.as_str();
        let directory = self.directory(provider_id).await?;
        let kid = account.directory_account_url.as_str();

        let request = NewOrderRequest {
            identifiers: hosts.iter().map(|h| Identifier::dns(&h.host)).collect(),
        };
        let response = self
            .post(
                provider_id,
                &directory,
                &key,
                Some(kid),
                &directory.new_order,
                Some(&request),
                cancel,
            )
            .await?;
        let order_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Wire("newOrder returned no Location header".into()))?;
        let mut order: Order = response.json().await?;
        // Re-poll bodies may omit the identifier list, so pin the set for
        // the CSR while the placement response certainly carries it.
        let identifiers = if order.identifiers.is_empty() {
            request.identifiers
        } else {
            order.identifiers.clone()
        };

        info!(
            account = %account_id,
            hosts = hosts.len(),
            "ACME order placed"
        );

        let deadline = Instant::now() + ORDER_DEADLINE;
        let mut cert_key: Option<rcgen::KeyPair> = None;

        loop {
            match order.status {
                OrderStatus::Pending => {
                    for auth_url in order.authorizations.clone() {
                        self.process_authorization(
                            provider_id, &directory, &key, kid, &auth_url, hosts, deadline, cancel,
                        )
                        .await?;
                    }
                    // All authorizations attempted a transition; poll the
                    // order out of pending.
                    loop {
                        self.pace(deadline, cancel, "order to leave pending").await?;
                        order = self
                            .post_as_get(provider_id, &directory, &key, kid, &order_url, cancel)
                            .await?;
                        if order.status != OrderStatus::Pending {
                            break;
                        }
                    }
                }
                OrderStatus::Ready => {
                    let generated = rcgen::KeyPair::generate()
                        .map_err(crate::certs::material::MaterialError::from)?;
                    let csr = csr_for_identifiers(&identifiers, &generated)?;
                    let request = FinalizeRequest {
                        csr: URL_SAFE_NO_PAD.encode(csr),
                    };
                    cert_key = Some(generated);
                    let response = self
                        .post(
                            provider_id,
                            &directory,
                            &key,
                            Some(kid),
                            &order.finalize,
                            Some(&request),
                            cancel,
                        )
                        .await?;
                    order = response.json().await?;
                }
                OrderStatus::Processing => {
                    self.pace(deadline, cancel, "order finalization").await?;
                    order = self
                        .post_as_get(provider_id, &directory, &key, kid, &order_url, cancel)
                        .await?;
                }
                OrderStatus::Valid => {
                    let certificate_url = order.certificate.as_deref().ok_or_else(|| {
                        AcmeError::Wire("valid order carries no certificate URL".into())
                    })?;
                    let response = self
                        .post::<()>(
                            provider_id,
                            &directory,
                            &key,
                            Some(kid),
                            certificate_url,
                            None,
                            cancel,
                        )
                        .await?;
                    let chain_pem = response.text().await?;
                    let cert_key = cert_key.ok_or_else(|| {
                        AcmeError::Wire("order became valid before finalization".into())
                    })?;
                    let material = CertificateMaterial::from_parts(
                        &chain_pem,
                        &cert_key.serialize_pem(),
                    )?;
                    info!(
                        account = %account_id,
                        fingerprint = %material.fingerprint,
                        not_after = %material.not_after,
                        "certificate issued"
                    );
                    return Ok(material);
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Validation {
                        resource: "order".to_string(),
                        status: "invalid".to_string(),
                    })
                }
            }
        }
    }

    // ---- authorization sub-flow ----

    #[allow(clippy::too_many_arguments)]
    async fn process_authorization(
        &self,
        provider_id: &str,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        auth_url: &str,
        hosts: &[AcmeHost],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        let auth: Authorization = self
            .post_as_get(provider_id, directory, key, kid, auth_url, cancel)
            .await?;

        if auth.status == "valid" {
            return Ok(());
        }
        if auth.status != "pending" {
            return Err(AcmeError::Validation {
                resource: format!("authorization for '{}'", auth.identifier.value),
                status: auth.status,
            });
        }

        // Find which configured host this authorization is for: either the
        // identifier itself, or the wildcard form of it.
        let identifier = auth.identifier.value.as_str();
        let wildcard_name = format!("*.{identifier}");
        let host = hosts
            .iter()
            .find(|h| {
                h.host.eq_ignore_ascii_case(identifier)
                    || (auth.wildcard && h.host.eq_ignore_ascii_case(&wildcard_name))
            })
            .ok_or_else(|| AcmeError::UnmatchedAuthorization(identifier.to_string()))?;

        let wanted = host.challenge.wire_name();
        let challenge = auth
            .challenges
            .iter()
            .find(|c| c.kind.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AcmeError::ChallengeUnavailable {
                host: host.host.clone(),
                challenge: wanted.to_string(),
            })?;

        debug!(
            host = %host.host,
            challenge = wanted,
            "executing authorization challenge"
        );

        match host.challenge {
            ChallengeKind::Http01 => {
                let key_auth = key.key_authorization(&challenge.token);
                let waiter = self.challenges.publish(&challenge.token, &key_auth);

                let result = async {
                    self.accept_challenge(provider_id, directory, key, kid, &challenge.url, cancel)
                        .await?;
                    waiter.wait(HTTP01_DELIVERY_WAIT, cancel).await?;
                    self.await_authorization(
                        provider_id, directory, key, kid, auth_url, deadline, cancel,
                    )
                    .await
                }
                .await;

                self.challenges.remove(&challenge.token);
                result
            }
            ChallengeKind::Dns01 { provider_id: dns_id } => {
                let key_auth = key.key_authorization(&challenge.token);
                let txt_value = URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()));
                let zone = host.host.strip_prefix("*.").unwrap_or(&host.host);
                let dns = self.dns.get(dns_id)?;

                // Record must exist before the provider validates.
                dns.create_record(zone, &txt_value).await?;

                let result = async {
                    self.accept_challenge(provider_id, directory, key, kid, &challenge.url, cancel)
                        .await?;
                    self.await_authorization(
                        provider_id, directory, key, kid, auth_url, deadline, cancel,
                    )
                    .await
                }
                .await;

                if let Err(err) = dns.delete_record(zone, &txt_value).await {
                    warn!(zone, error = %err, "DNS-01 record cleanup failed");
                }
                result
            }
        }
    }

    /// POST the empty-object acceptance to a challenge URL.
    async fn accept_challenge(
        &self,
        provider_id: &str,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        challenge_url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        self.post(
            provider_id,
            directory,
            key,
            Some(kid),
            challenge_url,
            Some(&serde_json::json!({})),
            cancel,
        )
        .await?;
        Ok(())
    }

    /// Poll an authorization until it leaves `pending`; anything but
    /// `valid` at that point fails the order.
    async fn await_authorization(
        &self,
        provider_id: &str,
        directory: &Directory,
        key: &AccountKey,
        kid: &str,
        auth_url: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        loop {
            self.pace(deadline, cancel, "authorization validation").await?;
            let auth: Authorization = self
                .post_as_get(provider_id, directory, key, kid, auth_url, cancel)
                .await?;
            match auth.status.as_str() {
                "pending" => continue,
                "valid" => return Ok(()),
                other => {
                    return Err(AcmeError::Validation {
                        resource: format!("authorization for '{}'", auth.identifier.value),
                        status: other.to_string(),
                    })
                }
            }
        }
    }

    /// One poll-interval sleep, bounded by the order deadline and the
    /// caller's cancellation token.
    async fn pace(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        what: &'static str,
    ) -> Result<(), AcmeError> {
        if Instant::now() >= deadline {
            return Err(AcmeError::Timeout(what));
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
            _ = cancel.cancelled() => Err(AcmeError::Canceled),
        }
    }
}

/// Blob key under which an account's PKCS#8 private key is stored.
fn account_key_blob(id: AccountId) -> String {
    format!("account-{id}")
}

/// Build a CSR whose SANs are exactly the order's DNS identifiers, with
/// the apex name (first identifier, wildcard prefix stripped) as CN.
fn csr_for_identifiers(
    identifiers: &[Identifier],
    key: &rcgen::KeyPair,
) -> Result<Vec<u8>, AcmeError> {
    let names: Vec<String> = identifiers.iter().map(|i| i.value.clone()).collect();
    if names.is_empty() {
        return Err(AcmeError::Wire("order carries no identifiers".into()));
    }
    let apex = names[0].strip_prefix("*.").unwrap_or(&names[0]).to_string();

    let mut params = rcgen::CertificateParams::new(names)
        .map_err(crate::certs::material::MaterialError::from)?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, apex);
    let csr = params
        .serialize_request(key)
        .map_err(crate::certs::material::MaterialError::from)?;
    Ok(csr.der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer;

    #[test]
    fn test_csr_covers_exactly_the_identifiers() {
        let key = rcgen::KeyPair::generate().unwrap();
        let identifiers = vec![
            Identifier::dns("*.example.com"),
            Identifier::dns("example.com"),
        ];
        let der = csr_for_identifiers(&identifiers, &key).unwrap();
        assert!(!der.is_empty());

        let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(&der)
            .unwrap();
        let sans: Vec<String> = csr
            .requested_extensions()
            .into_iter()
            .flatten()
            .filter_map(|ext| match ext {
                x509_parser::extensions::ParsedExtension::SubjectAlternativeName(san) => {
                    Some(san.general_names.iter().filter_map(|n| match n {
                        x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
                        _ => None,
                    }))
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(sans, vec!["*.example.com", "example.com"]);
    }

    #[test]
    fn test_dns01_txt_value_derivation() {
        // TXT value is base64url(SHA-256(keyAuthorization))
        let key_auth = "token.thumbprint";
        let txt = URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()));
        assert_eq!(txt.len(), 43);
        assert!(!txt.contains('='));
    }
}
