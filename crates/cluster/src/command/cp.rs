//! Endpoint parsing for `minikube cp`.
//!
//! An endpoint is `[node:]path`. The node prefix is only recognized when the
//! path after the colon is absolute, so `./a:b` and `C:relative` stay local.
use std::path::Path;

/// One side of a copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemotePath {
    /// Empty for the host, or when the node is left to the default.
    pub node: String,
    pub path: String,
}

/// Splits `[node:]path`.
pub fn new_remote_path(s: &str) -> RemotePath {
    if let Some((node, path)) = s.split_once(':') {
        let node_ok = !node.is_empty()
            && node
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if node_ok && path.starts_with('/') {
            return RemotePath {
                node: node.to_string(),
                path: path.to_string(),
            };
        }
    }
    RemotePath {
        node: String::new(),
        path: s.to_string(),
    }
}

/// Appends the base name of `src` when `dst` names a directory.
pub fn set_dst_file_name_from_src(dst: &str, src: &str) -> String {
    if dst.is_empty() {
        return String::new();
    }
    if dst.ends_with('/') {
        let base = Path::new(src)
            .file_name()
            .map(|b| b.to_string_lossy().into_owned())
            .unwrap_or_default();
        return format!("{}{}", dst, base);
    }
    dst.to_string()
}

/// A resolved copy request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyPlan {
    pub src: RemotePath,
    pub dst: RemotePath,
}

impl CopyPlan {
    /// Parses both endpoints. When neither names a node the destination is
    /// a path on `default_node`, which must be absolute.
    pub fn new(src: &str, dst: &str, default_node: &str) -> anyhow::Result<Self> {
        let src = new_remote_path(src);
        let mut dst = new_remote_path(dst);
        if src.path.is_empty() || dst.path.is_empty() {
            return Err(crate::reason::usage(
                "usage: minikube cp <source node name>:<source file path> <target node name>:<target file path>",
            ));
        }
        if src.node.is_empty() && dst.node.is_empty() {
            if !dst.path.starts_with('/') {
                return Err(crate::reason::usage(format!(
                    "<target file absolute path> must be an absolute path. Relative paths are not allowed (example: \"minikube:/home/docker/copied.txt\"), got {:?}",
                    dst.path
                )));
            }
            dst.node = default_node.to_string();
        }
        dst.path = set_dst_file_name_from_src(&dst.path, &src.path);
        Ok(CopyPlan { src, dst })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_paths() {
        let cases: [(&str, &str, &str); 22] = [
            ("", "", ""),
            ("~", "", "~"),
            ("/", "", "/"),
            ("/a", "", "/a"),
            ("/a/b", "", "/a/b"),
            ("./", "", "./"),
            ("./a", "", "./a"),
            ("./a/b", "", "./a/b"),
            ("../a", "", "../a"),
            ("a/b", "", "a/b"),
            ("minikube:", "", "minikube:"),
            ("minikube:/", "minikube", "/"),
            ("minikube:/a", "minikube", "/a"),
            ("minikube:/a/b", "minikube", "/a/b"),
            ("minikube:a", "", "minikube:a"),
            ("minikube:a/b", "", "minikube:a/b"),
            ("minikube-m02:/a", "minikube-m02", "/a"),
            ("m_01:/x", "m_01", "/x"),
            ("./:a/b", "", "./:a/b"),
            ("/:/a", "", "/:/a"),
            (":/a", "", ":/a"),
            ("no de:/a", "", "no de:/a"),
        ];
        for (input, node, path) in cases.iter() {
            assert_eq!(
                new_remote_path(input),
                RemotePath {
                    node: node.to_string(),
                    path: path.to_string()
                },
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn destination_file_names() {
        assert_eq!(set_dst_file_name_from_src("/dst/", "/src/a.txt"), "/dst/a.txt");
        assert_eq!(set_dst_file_name_from_src("", "/src/a.txt"), "");
        assert_eq!(set_dst_file_name_from_src("/dst/b.txt", "/src/a.txt"), "/dst/b.txt");
        assert_eq!(set_dst_file_name_from_src("/dst/", "a.txt"), "/dst/a.txt");
    }

    #[test]
    fn plans() {
        let p = CopyPlan::new("./a.txt", "/home/docker/", "minikube").expect("plan");
        assert_eq!(p.dst.node, "minikube");
        assert_eq!(p.dst.path, "/home/docker/a.txt");

        let p = CopyPlan::new("m02:/etc/hosts", "/tmp/hosts", "minikube").expect("plan");
        assert_eq!(p.src.node, "m02");
        assert!(p.dst.node.is_empty());

        assert!(CopyPlan::new("a.txt", "relative", "minikube").is_err());
        assert!(CopyPlan::new("", "/x", "minikube").is_err());
    }
}
