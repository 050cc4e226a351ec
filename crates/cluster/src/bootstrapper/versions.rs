//! Kubernetes version policy.
use semver::Version;

use crate::constants;
use crate::reason;

/// Versions known to misbehave, with a description and a link.
const PROBLEMATIC: &[(&str, &str, &str)] = &[
    (
        "v1.18.0",
        "kubeadm may fail to bring up kube-proxy on this release",
        "https://github.com/kubernetes/kubeadm/issues/2082",
    ),
    (
        "v1.24.0",
        "the dockershim was removed; the docker runtime requires cri-dockerd",
        "https://kubernetes.io/blog/2022/02/17/dockershim-faq/",
    ),
];

/// Parses a `v`-prefixed Kubernetes version.
pub fn parse(version: &str) -> anyhow::Result<Version> {
    Version::parse(version.trim_start_matches('v')).map_err(|e| {
        reason::with_kind(
            reason::INTERNAL_SEMVER_PARSE,
            anyhow::anyhow!("invalid Kubernetes version {:?}: {}", version, e),
        )
    })
}

/// Returns a warning for a release with known problems.
pub fn problematic(version: &str) -> Option<String> {
    PROBLEMATIC
        .iter()
        .find(|(v, _, _)| *v == version)
        .map(|(v, desc, url)| format!("Kubernetes {} has a known issue: {}. See {}", v, desc, url))
}

/// Validates `requested` against the supported range and against the
/// version an existing cluster already runs. Returns warnings to show.
pub fn check(profile: &str, existing: Option<&str>, requested: &str, force: bool) -> anyhow::Result<Vec<String>> {
    let want = parse(requested)?;
    let oldest = parse(constants::OLDEST_KUBERNETES_VERSION)?;
    let newest = parse(constants::NEWEST_KUBERNETES_VERSION)?;
    let mut warnings = Vec::new();

    if want < oldest {
        if !force {
            return Err(reason::with_kind(
                reason::K8S_OLD_UNSUPPORTED,
                anyhow::anyhow!(
                    "Kubernetes {} is not supported by this release of minikube, the oldest supported version is {}",
                    requested,
                    constants::OLDEST_KUBERNETES_VERSION
                ),
            ));
        }
        warnings.push(format!(
            "Specified Kubernetes version {} is less than the oldest supported version: {}",
            requested,
            constants::OLDEST_KUBERNETES_VERSION
        ));
    }
    if want > newest {
        warnings.push(format!(
            "Specified Kubernetes version {} is newer than the newest supported version: {}",
            requested,
            constants::NEWEST_KUBERNETES_VERSION
        ));
    }

    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        let have = parse(existing)?;
        if want < have && !force {
            return Err(reason::with_kind(
                reason::K8S_DOWNGRADE_UNSUPPORTED,
                anyhow::anyhow!("{}", downgrade_advice(profile, existing, requested, &have)),
            ));
        }
        if want > have {
            warnings.push(format!("Upgrading Kubernetes {} to {}", existing, requested));
        }
    }
    warnings.extend(problematic(requested));
    Ok(warnings)
}

fn downgrade_advice(profile: &str, existing: &str, requested: &str, have: &Version) -> String {
    let p = if profile == constants::DEFAULT_CLUSTER_NAME {
        String::new()
    } else {
        format!(" -p {}", profile)
    };
    format!(
        "Unable to safely downgrade existing Kubernetes {existing} cluster to {requested}\n\n\
         Suggestion:\n\n\
         1) Recreate the cluster with Kubernetes {requested}, by running:\n\n\
         \x20   minikube delete{p}\n\
         \x20   minikube start{p} --kubernetes-version={requested}\n\n\
         2) Create a second cluster with Kubernetes {requested}, by running:\n\n\
         \x20   minikube start -p {second} --kubernetes-version={requested}\n\n\
         3) Use the existing cluster at version Kubernetes {major}.{minor}.{patch}, by running:\n\n\
         \x20   minikube start{p} --kubernetes-version={existing}\n",
        existing = existing,
        requested = requested,
        p = p,
        second = format!("{}2", profile),
        major = have.major,
        minor = have.minor,
        patch = have.patch,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn kind(err: &anyhow::Error) -> &'static str {
        err.downcast_ref::<reason::ExitError>()
            .map(|e| e.kind.id)
            .unwrap_or("")
    }

    #[test]
    fn parses_with_prefix() {
        assert_eq!(parse("v1.28.3").expect("parse"), Version::new(1, 28, 3));
        assert_eq!(parse("1.28.3").expect("parse"), Version::new(1, 28, 3));
        assert!(parse("stable").is_err());
    }

    #[test]
    fn downgrades_are_refused_unless_forced() {
        let err = check("minikube", Some("v1.28.0"), "v1.27.0", false).expect_err("downgrade");
        assert_eq!(kind(&err), "K8S_DOWNGRADE_UNSUPPORTED");
        let msg = format!("{:#}", err);
        assert!(msg.contains("minikube delete"));
        assert!(msg.contains("Create a second cluster"));
        assert!(msg.contains("--kubernetes-version=v1.28.0"));

        assert!(check("minikube", Some("v1.28.0"), "v1.27.0", true).is_ok());
    }

    #[test]
    fn old_versions_are_refused() {
        let err = check("minikube", None, "v1.10.0", false).expect_err("old");
        assert_eq!(kind(&err), "K8S_OLD_UNSUPPORTED");
    }

    #[test]
    fn warnings_do_not_fail() {
        let w = check("minikube", Some("v1.23.0"), "v1.24.0", false).expect("upgrade");
        assert_eq!(w.len(), 2);
        let w = check("minikube", None, "v9.0.0", false).expect("new");
        assert!(w[0].contains("newer than"));
    }
}
