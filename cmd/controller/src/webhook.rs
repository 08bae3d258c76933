use actix_web::{post, web, HttpRequest, HttpResponse};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use runboat_controller::error::Error;

use crate::api::{ApiError, Controller};

/// What an incoming GitHub event asks of the controller.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookAction {
    Deploy {
        repo: String,
        target_branch: String,
        pr: Option<u64>,
        commit: String,
    },
    UndeployBranch {
        repo: String,
        branch: String,
    },
    UndeployPr {
        repo: String,
        pr: u64,
    },
    Ignore,
}

#[derive(Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: Repository,
}

#[derive(Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
    pull_request: PullRequest,
    repository: Repository,
}

#[derive(Deserialize)]
struct PullRequest {
    head: CommitRef,
    base: BranchRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    branch: String,
}

/// Reduce a GitHub event to a controller action. Anything that is not a
/// branch push or a relevant pull request activity is ignored.
pub fn parse_event(event_type: &str, body: &[u8]) -> Result<WebhookAction, serde_json::Error> {
    match event_type {
        "push" => {
            let event: PushEvent = serde_json::from_slice(body)?;
            let Some(branch) = event.git_ref.strip_prefix("refs/heads/") else {
                return Ok(WebhookAction::Ignore); // tag push
            };
            if event.deleted || event.after.chars().all(|c| c == '0') {
                Ok(WebhookAction::UndeployBranch {
                    repo: event.repository.full_name,
                    branch: branch.to_string(),
                })
            } else {
                Ok(WebhookAction::Deploy {
                    repo: event.repository.full_name,
                    target_branch: branch.to_string(),
                    pr: None,
                    commit: event.after,
                })
            }
        }
        "pull_request" => {
            let event: PullRequestEvent = serde_json::from_slice(body)?;
            match event.action.as_str() {
                "opened" | "synchronize" | "reopened" => Ok(WebhookAction::Deploy {
                    repo: event.repository.full_name,
                    target_branch: event.pull_request.base.branch,
                    pr: Some(event.number),
                    commit: event.pull_request.head.sha,
                }),
                "closed" => Ok(WebhookAction::UndeployPr {
                    repo: event.repository.full_name,
                    pr: event.number,
                }),
                _ => Ok(WebhookAction::Ignore),
            }
        }
        _ => Ok(WebhookAction::Ignore),
    }
}

/// Validate `X-Hub-Signature-256` against the shared secret. Comparison is
/// constant time through the mac verification.
pub fn signature_valid(signature_header: Option<&str>, body: &[u8], secret: &str) -> bool {
    let Some(signature) = signature_header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[post("/webhooks/github")]
pub async fn github(
    req: HttpRequest,
    body: web::Bytes,
    controller: Controller,
) -> Result<HttpResponse, ApiError> {
    if let Some(secret) = &controller.settings.github_webhook_secret {
        let signature = req
            .headers()
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !signature_valid(signature, &body, secret) {
            warn!("webhook with missing or invalid signature");
            return Err(ApiError::Unauthorized);
        }
    }

    let event_type = req
        .headers()
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let action = parse_event(event_type, &body)
        .map_err(|e| ApiError::Command(Error::Rejected(format!("malformed {event_type} event: {e}"))))?;

    match action {
        WebhookAction::Deploy {
            repo,
            target_branch,
            pr,
            commit,
        } => match controller.deploy(&repo, &target_branch, pr, &commit).await {
            Ok(name) => Ok(HttpResponse::Accepted().json(json!({ "name": name }))),
            // irrelevant repos and replayed deliveries are not errors here
            Err(Error::Rejected(reason)) => {
                debug!(%repo, %target_branch, %reason, "webhook ignored");
                Ok(HttpResponse::Ok().json(json!({ "detail": "ignored" })))
            }
            Err(Error::Conflict(_)) => Ok(HttpResponse::Ok().json(json!({ "detail": "exists" }))),
            Err(e) => Err(e.into()),
        },
        WebhookAction::UndeployBranch { repo, branch } => {
            let count = controller.undeploy_all(&repo, Some(&branch), None).await?;
            info!(%repo, %branch, count, "undeployed builds for deleted branch");
            Ok(HttpResponse::Accepted().json(json!({ "undeployed": count })))
        }
        WebhookAction::UndeployPr { repo, pr } => {
            let count = controller.undeploy_all(&repo, None, Some(pr)).await?;
            info!(%repo, pr, count, "undeployed builds for closed pull request");
            Ok(HttpResponse::Accepted().json(json!({ "undeployed": count })))
        }
        WebhookAction::Ignore => Ok(HttpResponse::Ok().json(json!({ "detail": "ignored" }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::Mac;

    #[test]
    fn branch_push_deploys() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "0123456789abcdef0123456789abcdef01234567",
            "deleted": false,
            "repository": { "full_name": "acme/svc" }
        });
        let action = parse_event("push", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            action,
            WebhookAction::Deploy {
                repo: "acme/svc".into(),
                target_branch: "main".into(),
                pr: None,
                commit: "0123456789abcdef0123456789abcdef01234567".into(),
            }
        );
    }

    #[test]
    fn branch_deletion_undeploys() {
        let body = serde_json::json!({
            "ref": "refs/heads/feature",
            "after": "0000000000000000000000000000000000000000",
            "deleted": true,
            "repository": { "full_name": "acme/svc" }
        });
        let action = parse_event("push", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            action,
            WebhookAction::UndeployBranch {
                repo: "acme/svc".into(),
                branch: "feature".into(),
            }
        );
    }

    #[test]
    fn tag_pushes_are_ignored() {
        let body = serde_json::json!({
            "ref": "refs/tags/v1.0",
            "after": "0123456789abcdef0123456789abcdef01234567",
            "repository": { "full_name": "acme/svc" }
        });
        assert_eq!(
            parse_event("push", body.to_string().as_bytes()).unwrap(),
            WebhookAction::Ignore
        );
    }

    #[test]
    fn pull_request_activity_deploys_against_the_base_branch() {
        let body = serde_json::json!({
            "action": "synchronize",
            "number": 42,
            "pull_request": {
                "head": { "sha": "0123456789abcdef0123456789abcdef01234567" },
                "base": { "ref": "16.0" }
            },
            "repository": { "full_name": "acme/svc" }
        });
        let action = parse_event("pull_request", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            action,
            WebhookAction::Deploy {
                repo: "acme/svc".into(),
                target_branch: "16.0".into(),
                pr: Some(42),
                commit: "0123456789abcdef0123456789abcdef01234567".into(),
            }
        );
    }

    #[test]
    fn closed_pull_request_undeploys() {
        let body = serde_json::json!({
            "action": "closed",
            "number": 42,
            "pull_request": {
                "head": { "sha": "0123456789abcdef0123456789abcdef01234567" },
                "base": { "ref": "16.0" }
            },
            "repository": { "full_name": "acme/svc" }
        });
        assert_eq!(
            parse_event("pull_request", body.to_string().as_bytes()).unwrap(),
            WebhookAction::UndeployPr {
                repo: "acme/svc".into(),
                pr: 42,
            }
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(
            parse_event("star", b"{}").unwrap(),
            WebhookAction::Ignore
        );
    }

    #[test]
    fn malformed_payloads_error() {
        assert!(parse_event("push", b"not json").is_err());
    }

    #[test]
    fn signature_round_trip() {
        let secret = "hush";
        let body = b"payload";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(signature_valid(Some(&header), body, secret));
        assert!(!signature_valid(Some(&header), b"tampered", secret));
        assert!(!signature_valid(Some(&header), body, "other"));
        assert!(!signature_valid(None, body, secret));
        assert!(!signature_valid(Some("sha256=zz"), body, secret));
        assert!(!signature_valid(Some("sha1=abcd"), body, secret));
    }
}
