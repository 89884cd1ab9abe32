//! Vulnerability scanning of manifests.
//!
//! Image manifests are submitted to the Trivy sidecar; the findings are
//! merged with the account's security scan policies, aggregated into a
//! single status, and the enriched report is persisted to storage. Image
//! lists are never scanned themselves; their status is the maximum over
//! their children.

use std::str::FromStr;

use anyhow::{format_err, Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use stevedore_api_types::{
    CompiledSecurityScanPolicy, Identity, SecurityScanPolicy, VulnStatus,
};
use stevedore_db::{accounts, manifests, security, AccountRow, DbError, ManifestRow};

use crate::registry::image_ref::ImageRef;
use crate::registry::manifest::media_types;
use crate::server::{Janitor, JobDesc, Task};

static VULN_CHECK_DESC: JobDesc = JobDesc {
    name: "vulnerability check",
    counter_name: "stevedore_vulnerability_checks",
    counter_help: "Counter for vulnerability check operations.",
};

const REPORT_FORMAT: &str = "json";

fn severity_from_report(raw: &str) -> VulnStatus {
    match raw {
        "LOW" => VulnStatus::Low,
        "MEDIUM" => VulnStatus::Medium,
        "HIGH" => VulnStatus::High,
        "CRITICAL" => VulnStatus::Critical,
        // the scanner could not rate the finding
        _ => VulnStatus::Low,
    }
}

fn severity_to_report(status: VulnStatus) -> &'static str {
    match status {
        VulnStatus::Low => "LOW",
        VulnStatus::Medium => "MEDIUM",
        VulnStatus::High => "HIGH",
        VulnStatus::Critical => "CRITICAL",
        _ => "UNKNOWN",
    }
}

/// Merges scanner findings with the account's policies.
///
/// Matching `ignore` policies drop a finding from the aggregate; severity
/// overrides can only lower what the scanner reported. Either way the
/// finding stays in the report, annotated with the applied policy, so the
/// enriched report shows what was judged away and why. An end-of-support
/// base image makes the whole image `Rotten` regardless of findings.
pub(crate) fn apply_policies_to_report(
    mut report: Value,
    policies: &[CompiledSecurityScanPolicy],
    repo_name: &str,
) -> (VulnStatus, Value) {
    let mut aggregate = VulnStatus::Clean;

    if let Some(results) = report
        .get_mut("Results")
        .and_then(|results| results.as_array_mut())
    {
        for result in results {
            let vulnerabilities = match result
                .get_mut("Vulnerabilities")
                .and_then(|vulns| vulns.as_array_mut())
            {
                Some(vulns) => vulns,
                None => continue,
            };
            for finding in vulnerabilities {
                let id = finding
                    .get("VulnerabilityID")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let severity = severity_from_report(
                    finding.get("Severity").and_then(Value::as_str).unwrap_or(""),
                );
                let fix_released = finding
                    .get("FixedVersion")
                    .and_then(Value::as_str)
                    .map(|v| !v.is_empty())
                    .unwrap_or(false);

                let policy = policies
                    .iter()
                    .find(|policy| policy.matches(repo_name, &id, fix_released));
                match policy {
                    Some(policy) if policy.policy.action.ignore => {
                        finding["X-Stevedore-Assessment"] =
                            Value::String(policy.policy.action.assessment.clone());
                        finding["X-Stevedore-Ignored"] = Value::Bool(true);
                        // ignored findings do not contribute to the aggregate
                    }
                    Some(policy) => {
                        let overridden = policy
                            .policy
                            .action
                            .severity
                            .unwrap_or(severity)
                            .min(severity);
                        finding["X-Stevedore-Assessment"] =
                            Value::String(policy.policy.action.assessment.clone());
                        finding["Severity"] =
                            Value::String(severity_to_report(overridden).to_string());
                        aggregate = aggregate.merge(overridden);
                    }
                    None => {
                        aggregate = aggregate.merge(severity);
                    }
                }
            }
        }
    }

    let eosl = report
        .pointer("/Metadata/OS/EOSL")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if eosl {
        aggregate = aggregate.merge(VulnStatus::Rotten);
    }

    (aggregate, report)
}

pub struct DueVulnCheck {
    candidate: security::SecurityCheckCandidate,
    account: AccountRow,
    manifest: ManifestRow,
}

pub struct VulnCheckTask {
    janitor: Janitor,
}

impl VulnCheckTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    /// Status of an image list: the maximum over its children, or
    /// `Pending` while any child has not been scanned yet.
    async fn check_image_list(&self, item: &DueVulnCheck) -> Result<VulnStatus, Error> {
        let pool = self.janitor.db().pool();
        let manifest = &item.manifest;

        let expected =
            manifests::list_child_digests(pool, manifest.repo_id, &manifest.digest).await?;
        let statuses =
            security::get_child_statuses(pool, manifest.repo_id, &manifest.digest).await?;

        if statuses.len() < expected.len() {
            return Ok(VulnStatus::Pending);
        }
        let mut aggregate = VulnStatus::Clean;
        for (_, raw_status) in statuses {
            let status = VulnStatus::from_str(&raw_status)?;
            if status == VulnStatus::Pending {
                return Ok(VulnStatus::Pending);
            }
            aggregate = aggregate.merge(status);
        }
        Ok(aggregate)
    }

    /// Submits a plain image manifest to the scanner and stores the
    /// enriched report.
    async fn check_image(
        &self,
        item: &DueVulnCheck,
        policies: &[CompiledSecurityScanPolicy],
    ) -> Result<VulnStatus, Error> {
        let candidate = &item.candidate;
        let manifest = &item.manifest;

        let identity = Identity::janitor("vulnerability check");
        let token = self.janitor.token_issuer().issue_pull_token(
            &identity,
            &candidate.account_name,
            &candidate.repo_name,
        )?;
        let image_ref = ImageRef::by_digest(
            &candidate.account_name,
            &candidate.repo_name,
            manifest.digest.parse()?,
        );

        let report = self
            .janitor
            .scanner()
            .scan_manifest(&image_ref.to_string(), &token)
            .await
            .context("vulnerability scan failed")?;

        let (status, enriched) =
            apply_policies_to_report(report, policies, &candidate.repo_name);

        let payload = Bytes::from(serde_json::to_vec(&enriched)?);
        self.janitor
            .storage()
            .write_trivy_report(
                &candidate.account_name,
                &candidate.repo_name,
                &manifest.digest,
                REPORT_FORMAT,
                payload,
            )
            .await?;

        Ok(status)
    }
}

#[async_trait]
impl Task for VulnCheckTask {
    type Item = DueVulnCheck;

    fn desc(&self) -> &'static JobDesc {
        &VULN_CHECK_DESC
    }

    async fn discover(&self) -> Result<Option<DueVulnCheck>, Error> {
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();
        let next = clock.next_run(self.janitor.config().vuln_check_interval);

        let candidate = match security::claim_due_check(pool, clock.now(), next).await? {
            Some(candidate) => candidate,
            None => return Ok(None),
        };
        let account = accounts::get_account(pool, &candidate.account_name)
            .await?
            .ok_or(DbError::NotFound("account of scanned manifest"))?;
        let manifest = manifests::get_manifest(pool, candidate.info.repo_id, &candidate.info.digest)
            .await?
            .ok_or(DbError::NotFound("manifest behind security info"))?;
        Ok(Some(DueVulnCheck {
            candidate,
            account,
            manifest,
        }))
    }

    async fn process(&self, item: DueVulnCheck) -> Result<(), Error> {
        let config = self.janitor.config();
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();
        let info = &item.candidate.info;
        let manifest = &item.manifest;

        let policies = SecurityScanPolicy::parse_list(&item.account.security_scan_policies_json)
            .with_context(|| {
                format!("invalid security scan policies on account {}", item.account.name)
            })?;
        let compiled = policies
            .iter()
            .map(SecurityScanPolicy::compile)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| {
                format!("invalid security scan policies on account {}", item.account.name)
            })?;

        // blobs the scanner cannot digest make the whole manifest
        // unsupported
        if !media_types::is_image_list(&manifest.media_type) {
            let blobs =
                manifests::list_blobs_of_manifest(pool, manifest.repo_id, &manifest.digest)
                    .await?;
            let blocked = blobs.iter().find(|blob| {
                blob.blocks_vuln_scanning
                    || blob.size_bytes as u64 > config.max_uncompressed_layer_bytes
            });
            if let Some(blob) = blocked {
                let now = clock.now();
                security::update_check_result(
                    pool,
                    info.repo_id,
                    &info.digest,
                    &VulnStatus::Unsupported.to_string(),
                    &format!("layer {} is too large to scan", blob.digest),
                    Some(now),
                    clock.next_run(config.vuln_check_unsupported_interval),
                    info.has_enriched_report,
                    now,
                )
                .await?;
                return Ok(());
            }
        }

        let outcome = if media_types::is_image_list(&manifest.media_type) {
            self.check_image_list(&item).await.map(|status| (status, false))
        } else {
            self.check_image(&item, &compiled).await.map(|status| (status, true))
        };

        match outcome {
            Ok((status, wrote_report)) => {
                let now = clock.now();
                let next = if status == VulnStatus::Pending {
                    clock.next_run(config.vuln_check_error_retry_interval)
                } else {
                    clock.next_run(config.vuln_check_interval)
                };
                security::update_check_result(
                    pool,
                    info.repo_id,
                    &info.digest,
                    &status.to_string(),
                    "",
                    Some(now),
                    next,
                    wrote_report || info.has_enriched_report,
                    now,
                )
                .await?;
                Ok(())
            }
            Err(err) => {
                // transient scanner errors are recorded and surfaced so
                // the runner counts the failure
                let message = format!("{err:#}");
                security::update_check_result(
                    pool,
                    info.repo_id,
                    &info.digest,
                    &VulnStatus::Error.to_string(),
                    &message,
                    info.checked_at,
                    clock.next_run(config.vuln_check_error_retry_interval),
                    info.has_enriched_report,
                    clock.now(),
                )
                .await?;
                Err(format_err!(
                    "vulnerability check of {}/{}@{} failed: {message}",
                    item.candidate.account_name,
                    item.candidate.repo_name,
                    info.digest,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_report() -> Value {
        json!({
            "Results": [
                {
                    "Target": "library/app (alpine 3.18)",
                    "Vulnerabilities": [
                        {
                            "VulnerabilityID": "CVE-2024-0001",
                            "Severity": "CRITICAL",
                            "FixedVersion": "1.2.3"
                        },
                        {
                            "VulnerabilityID": "CVE-2024-0002",
                            "Severity": "MEDIUM",
                            "FixedVersion": ""
                        }
                    ]
                }
            ],
            "Metadata": {"OS": {"Family": "alpine", "EOSL": false}}
        })
    }

    fn compile(policies: &[SecurityScanPolicy]) -> Vec<CompiledSecurityScanPolicy> {
        policies.iter().map(|p| p.compile().unwrap()).collect()
    }

    #[test]
    fn aggregate_without_policies_is_max_severity() {
        let (status, _) = apply_policies_to_report(sample_report(), &[], "app");
        assert_eq!(status, VulnStatus::Critical);
    }

    #[test]
    fn ignore_policy_drops_finding_from_aggregate() {
        let policies: Vec<SecurityScanPolicy> = serde_json::from_value(json!([
            {
                "match_repository": ".*",
                "match_vulnerability_id": "CVE-2024-0001",
                "action": {"assessment": "mitigated by seccomp profile", "ignore": true}
            }
        ]))
        .unwrap();

        let (status, enriched) =
            apply_policies_to_report(sample_report(), &compile(&policies), "app");
        assert_eq!(status, VulnStatus::Medium);

        // the finding stays in the report, annotated
        let finding = &enriched["Results"][0]["Vulnerabilities"][0];
        assert_eq!(finding["X-Stevedore-Ignored"], json!(true));
        assert_eq!(
            finding["X-Stevedore-Assessment"],
            json!("mitigated by seccomp profile"),
        );
    }

    #[test]
    fn severity_override_only_downgrades() {
        let policies: Vec<SecurityScanPolicy> = serde_json::from_value(json!([
            {
                "match_repository": ".*",
                "match_vulnerability_id": "CVE-2024-.*",
                "action": {"assessment": "vendored copy is unused", "severity": "High"}
            }
        ]))
        .unwrap();

        let (status, enriched) =
            apply_policies_to_report(sample_report(), &compile(&policies), "app");
        // CRITICAL is lowered to High; MEDIUM must not be raised
        assert_eq!(status, VulnStatus::High);
        assert_eq!(
            enriched["Results"][0]["Vulnerabilities"][1]["Severity"],
            json!("MEDIUM"),
        );
    }

    #[test]
    fn fix_released_filter_limits_policy() {
        let policies: Vec<SecurityScanPolicy> = serde_json::from_value(json!([
            {
                "match_repository": ".*",
                "match_vulnerability_id": "CVE-2024-.*",
                "only_if_no_fix_released": true,
                "action": {"assessment": "waiting for upstream fix", "ignore": true}
            }
        ]))
        .unwrap();

        // CVE-2024-0001 has a fix released, so only CVE-2024-0002 is
        // ignored and the critical finding keeps counting
        let (status, _) = apply_policies_to_report(sample_report(), &compile(&policies), "app");
        assert_eq!(status, VulnStatus::Critical);
    }

    #[test]
    fn eosl_base_image_is_rotten() {
        let mut report = sample_report();
        report["Metadata"]["OS"]["EOSL"] = json!(true);
        let (status, _) = apply_policies_to_report(report, &[], "app");
        assert_eq!(status, VulnStatus::Rotten);
    }

    #[test]
    fn clean_report_is_clean() {
        let report = json!({"Results": [], "Metadata": {"OS": {"EOSL": false}}});
        let (status, _) = apply_policies_to_report(report, &[], "app");
        assert_eq!(status, VulnStatus::Clean);
    }
}
