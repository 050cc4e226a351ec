//! Cluster certificate authorities and the certificates signed by them.
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType, PKCS_ECDSA_P256_SHA256,
};
use tracing::{debug, info, instrument};

use crate::command::{Asset, Cmd, Runner};
use crate::config::{ClusterConfig, Node};
use crate::constants::{self, vmpath};
use crate::kubeconfig;
use crate::localpath::MiniHome;

const CA_CN: &str = "minikubeCA";
const PROXY_CA_CN: &str = "proxyClientCA";

/// A certificate and key as PEM.
#[derive(Clone, Debug)]
pub struct KeyPairPem {
    pub cert: String,
    pub key: String,
}

/// A loaded or freshly generated certificate authority.
pub struct Authority {
    cert: Certificate,
    cert_pem: String,
}

impl Authority {
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Signs a leaf certificate.
    pub fn sign(&self, params: CertificateParams) -> anyhow::Result<KeyPairPem> {
        let leaf = Certificate::from_params(params)?;
        Ok(KeyPairPem {
            cert: leaf.serialize_pem_with_signer(&self.cert)?,
            key: leaf.serialize_private_key_pem(),
        })
    }
}

fn base_params(common_name: &str, organization: Option<&str>) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.not_before = chrono::Utc::now() - chrono::Duration::days(1);
    params.not_after = chrono::Utc::now()
        + chrono::Duration::from_std(constants::DEFAULT_CERT_EXPIRATION)?;
    let mut distinguished_name = DistinguishedName::new();
    if let Some(org) = organization {
        distinguished_name.push(DnType::OrganizationName, org);
    }
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;
    params
        .key_pair
        .replace(KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    Ok(params)
}

/// Loads the CA at `cert`/`key`, generating and saving it when either file
/// is missing.
#[instrument(level = "debug", skip_all, fields(cert = %cert_path.display()))]
pub async fn ensure_authority(cert_path: &Path, key_path: &Path, common_name: &str) -> anyhow::Result<Authority> {
    if cert_path.exists() && key_path.exists() {
        let cert_pem = tokio::fs::read_to_string(cert_path)
            .await
            .with_context(|| format!("reading {}", cert_path.display()))?;
        let key_pem = tokio::fs::read_to_string(key_path)
            .await
            .with_context(|| format!("reading {}", key_path.display()))?;
        let key = KeyPair::from_pem(&key_pem)
            .with_context(|| format!("parsing {}", key_path.display()))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key)
            .with_context(|| format!("parsing {}", cert_path.display()))?;
        debug!("reusing existing certificate authority");
        return Ok(Authority {
            cert: Certificate::from_params(params)?,
            cert_pem,
        });
    }

    let mut params = base_params(common_name, None)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_after = chrono::Utc::now() + chrono::Duration::weeks(52 * 10);
    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem()?;
    write_pair(cert_path, key_path, &KeyPairPem {
        cert: cert_pem.clone(),
        key: cert.serialize_private_key_pem(),
    })
    .await?;
    info!(ca = common_name, "generated certificate authority");
    Ok(Authority { cert, cert_pem })
}

async fn write_pair(cert_path: &Path, key_path: &Path, pair: &KeyPairPem) -> anyhow::Result<()> {
    if let Some(dir) = cert_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    tokio::fs::write(cert_path, &pair.cert)
        .await
        .with_context(|| format!("writing {}", cert_path.display()))?;
    crate::config::write_private(key_path, pair.key.as_bytes()).await
}

/// The first usable address of an IPv4 CIDR, e.g. `10.96.0.1` for
/// `10.96.0.0/12`.
pub fn first_ip(cidr: &str) -> anyhow::Result<Ipv4Addr> {
    let (addr, bits) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid CIDR {:?}", cidr))?;
    let addr: Ipv4Addr = addr.parse().with_context(|| format!("invalid CIDR {:?}", cidr))?;
    let bits: u32 = bits.parse().with_context(|| format!("invalid CIDR {:?}", cidr))?;
    anyhow::ensure!(bits <= 32, "invalid CIDR {:?}", cidr);
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ok(Ipv4Addr::from((u32::from(addr) & mask) + 1))
}

/// Addresses and names the apiserver certificate is valid for.
pub fn apiserver_sans(cc: &ClusterConfig, node_ip: &str) -> anyhow::Result<(Vec<IpAddr>, Vec<String>)> {
    let kc = &cc.kubernetes_config;
    let service_cidr = if kc.service_cidr.is_empty() {
        constants::DEFAULT_SERVICE_CIDR
    } else {
        kc.service_cidr.as_str()
    };
    let mut ips: Vec<IpAddr> = vec![
        IpAddr::V4(first_ip(service_cidr)?),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
    ];
    for raw in std::iter::once(node_ip)
        .chain(kc.api_server_ips.iter().map(String::as_str))
        .chain(std::iter::once(kc.api_server_ha_vip.as_str()))
    {
        if raw.is_empty() {
            continue;
        }
        let ip: IpAddr = raw.parse().with_context(|| format!("invalid IP {:?}", raw))?;
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    let dns_domain = if kc.dns_domain.is_empty() {
        constants::CLUSTER_DNS_DOMAIN
    } else {
        kc.dns_domain.as_str()
    };
    let mut names: Vec<String> = kc.api_server_names.clone();
    names.extend([
        kc.api_server_name.clone(),
        "kubernetes.default.svc.".to_string() + dns_domain,
        "kubernetes.default.svc".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes".to_string(),
        "localhost".to_string(),
        constants::CONTROL_PLANE_ALIAS.to_string(),
    ]);
    let mut seen = std::collections::HashSet::new();
    names.retain(|n| !n.is_empty() && seen.insert(n.clone()));
    Ok((ips, names))
}

fn apiserver_params(cc: &ClusterConfig, node_ip: &str) -> anyhow::Result<CertificateParams> {
    let (ips, names) = apiserver_sans(cc, node_ip)?;
    let mut params = base_params("minikube", Some("system:masters"))?;
    params.subject_alt_names = ips
        .into_iter()
        .map(SanType::IpAddress)
        .chain(names.into_iter().map(SanType::DnsName))
        .collect();
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    Ok(params)
}

fn client_params(common_name: &str, organization: &str) -> anyhow::Result<CertificateParams> {
    let mut params = base_params(common_name, Some(organization))?;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    Ok(params)
}

/// Paths of the certificates a profile owns on the host.
#[derive(Clone, Debug)]
pub struct ProfileCerts {
    pub dir: PathBuf,
}

impl ProfileCerts {
    pub fn new(home: &MiniHome, profile: &str) -> Self {
        ProfileCerts {
            dir: home.profile(profile),
        }
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Generates missing certificates for `node` and installs them in the guest.
///
/// The shared CAs under the minikube home are created once and reused. The
/// client certificate is per profile. The apiserver certificate is
/// regenerated on every call so that its SANs follow the config.
#[instrument(level = "info", skip_all, fields(profile = %cc.name, node = %node.name))]
pub async fn setup_certs(home: &MiniHome, cc: &ClusterConfig, node: &Node, runner: &dyn Runner) -> anyhow::Result<()> {
    let ca = ensure_authority(&home.ca_cert(), &home.ca_key(), CA_CN).await?;
    let proxy_ca = ensure_authority(&home.proxy_ca_cert(), &home.proxy_ca_key(), PROXY_CA_CN).await?;
    let profile = ProfileCerts::new(home, &cc.name);

    let client_cert = home.client_cert(&cc.name);
    let client_key = home.client_key(&cc.name);
    if !client_cert.exists() || !client_key.exists() {
        let pair = ca.sign(client_params("minikube-user", "system:masters")?)?;
        write_pair(&client_cert, &client_key, &pair).await?;
    }

    let mut guest_files: Vec<(String, Vec<u8>, &str)> = vec![
        ("ca.crt".to_string(), ca.cert_pem().as_bytes().to_vec(), "0644"),
        ("ca.key".to_string(), tokio::fs::read(home.ca_key()).await?, "0600"),
        ("proxy-client-ca.crt".to_string(), proxy_ca.cert_pem().as_bytes().to_vec(), "0644"),
        ("proxy-client-ca.key".to_string(), tokio::fs::read(home.proxy_ca_key()).await?, "0600"),
    ];

    if node.control_plane {
        let apiserver = ca.sign(apiserver_params(cc, &node.ip)?)?;
        write_pair(&profile.file("apiserver.crt"), &profile.file("apiserver.key"), &apiserver).await?;
        let proxy = proxy_ca.sign(client_params("aggregator", "system:masters")?)?;
        write_pair(&profile.file("proxy-client.crt"), &profile.file("proxy-client.key"), &proxy).await?;
        guest_files.push(("apiserver.crt".to_string(), apiserver.cert.into_bytes(), "0644"));
        guest_files.push(("apiserver.key".to_string(), apiserver.key.into_bytes(), "0600"));
        guest_files.push(("proxy-client.crt".to_string(), proxy.cert.into_bytes(), "0644"));
        guest_files.push(("proxy-client.key".to_string(), proxy.key.into_bytes(), "0600"));
    }

    let mut kubelet = client_params(&format!("system:node:{}", node.name), "system:nodes")?;
    kubelet.subject_alt_names = vec![SanType::DnsName(node.name.clone())];
    if let Ok(ip) = node.ip.parse() {
        kubelet.subject_alt_names.push(SanType::IpAddress(ip));
    }
    let kubelet = ca.sign(kubelet)?;
    guest_files.push(("kubelet.crt".to_string(), kubelet.cert.into_bytes(), "0644"));
    guest_files.push(("kubelet.key".to_string(), kubelet.key.into_bytes(), "0600"));

    for (name, data, perm) in guest_files {
        runner
            .copy(&Asset::memory(data, vmpath::GUEST_CERTS_DIR, name, perm))
            .await?;
    }

    let guest_kubeconfig = guest_kubeconfig(cc)?;
    runner
        .copy(&Asset::memory(
            guest_kubeconfig.into_bytes(),
            vmpath::GUEST_PERSISTENT_DIR,
            "kubeconfig",
            "0644",
        ))
        .await?;
    install_trust(runner, ca.cert_pem()).await?;
    Ok(())
}

/// The kubeconfig used inside the guest by the addon manager and kubectl.
pub fn guest_kubeconfig(cc: &ClusterConfig) -> anyhow::Result<String> {
    let certs = |f: &str| format!("{}/{}", vmpath::GUEST_CERTS_DIR, f);
    let name = cc.name.as_str();
    let cfg = kubeconfig::Config {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![kubeconfig::NamedCluster {
            name: name.to_string(),
            cluster: kubeconfig::Cluster {
                server: kubeconfig::server_url(constants::CONTROL_PLANE_ALIAS, cc.api_server_port),
                certificate_authority: Some(certs("ca.crt")),
                ..Default::default()
            },
        }],
        users: vec![kubeconfig::NamedUser {
            name: name.to_string(),
            user: kubeconfig::User {
                client_certificate: Some(certs("apiserver.crt")),
                client_key: Some(certs("apiserver.key")),
                ..Default::default()
            },
        }],
        contexts: vec![kubeconfig::NamedContext {
            name: name.to_string(),
            context: kubeconfig::ContextEntry {
                cluster: name.to_string(),
                user: name.to_string(),
                ..Default::default()
            },
        }],
        current_context: name.to_string(),
        ..Default::default()
    };
    Ok(serde_yaml::to_string(&cfg)?)
}

async fn install_trust(runner: &dyn Runner, ca_pem: &str) -> anyhow::Result<()> {
    runner
        .copy(&Asset::memory(
            ca_pem.as_bytes().to_vec(),
            "/usr/share/ca-certificates",
            "minikubeCA.pem",
            "0644",
        ))
        .await?;
    runner
        .run(Cmd::shell(
            "test -s /usr/share/ca-certificates/minikubeCA.pem && sudo ln -fs /usr/share/ca-certificates/minikubeCA.pem /etc/ssl/certs/minikubeCA.pem",
        ))
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn service_cidr_first_ip() {
        assert_eq!(first_ip("10.96.0.0/12").expect("cidr"), Ipv4Addr::new(10, 96, 0, 1));
        assert_eq!(first_ip("10.96.3.7/16").expect("cidr"), Ipv4Addr::new(10, 96, 0, 1));
        assert!(first_ip("10.96.0.0").is_err());
    }

    #[test]
    fn apiserver_sans_cover_names_and_ips() {
        let mut cc = ClusterConfig::new("minikube");
        cc.kubernetes_config.api_server_names = vec!["k8s.example.com".to_string()];
        cc.kubernetes_config.api_server_ips = vec!["203.0.113.7".to_string()];
        let (ips, names) = apiserver_sans(&cc, "192.168.49.2").expect("sans");
        for ip in ["10.96.0.1", "127.0.0.1", "10.0.0.1", "192.168.49.2", "203.0.113.7"] {
            assert!(ips.contains(&ip.parse().expect("ip")), "missing {}", ip);
        }
        for name in ["k8s.example.com", "minikubeCA", "kubernetes.default.svc.cluster.local", "localhost", "control-plane.minikube.internal"] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }

        cc.kubernetes_config.api_server_ips = vec!["nope".to_string()];
        assert!(apiserver_sans(&cc, "").is_err());
    }

    #[tokio::test]
    async fn authorities_are_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert = dir.path().join("ca.crt");
        let key = dir.path().join("ca.key");
        let first = ensure_authority(&cert, &key, CA_CN).await.expect("generate");
        let second = ensure_authority(&cert, &key, CA_CN).await.expect("reuse");
        assert_eq!(first.cert_pem(), second.cert_pem());
        let leaf = second.sign(client_params("minikube-user", "system:masters").expect("params")).expect("sign");
        assert!(leaf.cert.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn control_plane_certs_are_pushed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let mut cc = ClusterConfig::new("minikube");
        let node = Node {
            name: "minikube".to_string(),
            ip: "192.168.49.2".to_string(),
            control_plane: true,
            worker: true,
            ..Default::default()
        };
        cc.nodes.push(node.clone());
        let runner = FakeRunner::default();
        setup_certs(&home, &cc, &node, &runner).await.expect("certs");

        assert!(home.client_cert("minikube").exists());
        assert!(home.profile("minikube").join("apiserver.crt").exists());
        let cmds = runner.commands();
        for f in ["ca.crt", "apiserver.key", "proxy-client.crt", "kubelet.crt"] {
            let target = format!("/var/lib/minikube/certs/{}", f);
            assert!(cmds.iter().any(|c| c.contains(&target)), "missing {}", f);
        }
        assert!(cmds.iter().any(|c| c.contains("/var/lib/minikube/kubeconfig")));
    }

    #[test]
    fn guest_kubeconfig_points_at_the_alias() {
        let cc = ClusterConfig::new("minikube");
        let cfg = guest_kubeconfig(&cc).expect("kubeconfig");
        assert!(cfg.contains("https://control-plane.minikube.internal:8443"));
        assert!(cfg.contains("/var/lib/minikube/certs/apiserver.crt"));
    }
}
