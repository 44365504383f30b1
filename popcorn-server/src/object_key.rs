//! Compiled-object cache keys
//!
//! Two sessions must share a cache slot exactly when they would produce the
//! same object: same compiler, same argv after include-dir rewriting, and
//! the same unordered multiset of (basename, digest) dependencies. The
//! digest half of the key XORs the per-file digests, which is insensitive
//! to file order by construction; the textual half sorts its dependency
//! list for the same reason. XOR is not collision-resistant against chosen
//! inputs, which is acceptable inside a trusted build cluster.

use popcorn_protocol::ContentDigest;

/// Key of one entry in the compiled-object cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    /// XOR of every required-file digest
    pub digest: ContentDigest,
    /// Textual discriminator carrying compiler, argv and dependency list
    pub extra: String,
}

/// Compute the object-cache key for one session
pub fn object_key(
    compiler: &str,
    args: &[String],
    dependencies: &[(String, ContentDigest)],
) -> ObjectKey {
    let mut digest = ContentDigest::UNKNOWN;
    for (_, file_digest) in dependencies {
        digest ^= *file_digest;
    }

    let mut sorted: Vec<&(String, ContentDigest)> = dependencies.iter().collect();
    sorted.sort_by_key(|(name, file_digest)| (name.clone(), file_digest.to_bytes()));

    let mut extra = format!("compiler-{compiler};args-{}", args.join(" "));
    extra.push_str(";depends-");
    for (name, file_digest) in sorted {
        extra.push_str(name);
        extra.push_str(&file_digest.to_string());
    }
    ObjectKey { digest, extra }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(entries: &[(&str, &[u8])]) -> Vec<(String, ContentDigest)> {
        entries
            .iter()
            .map(|(name, content)| ((*name).to_string(), ContentDigest::of_bytes(content)))
            .collect()
    }

    #[test]
    fn test_key_ignores_dependency_order() {
        let args = vec!["-O2".to_string()];
        let forward = deps(&[("a.cpp", b"main"), ("h1.h", b"one"), ("h2.h", b"two")]);
        let mut shuffled = forward.clone();
        shuffled.rotate_left(2);

        assert_eq!(
            object_key("g++", &args, &forward),
            object_key("g++", &args, &shuffled)
        );
    }

    #[test]
    fn test_key_separates_compilers_and_args() {
        let dependencies = deps(&[("a.cpp", b"main")]);
        let o2 = vec!["-O2".to_string()];
        let o3 = vec!["-O3".to_string()];

        assert_ne!(
            object_key("g++", &o2, &dependencies),
            object_key("clang++", &o2, &dependencies)
        );
        assert_ne!(
            object_key("g++", &o2, &dependencies),
            object_key("g++", &o3, &dependencies)
        );
    }

    #[test]
    fn test_key_separates_changed_content() {
        let args = vec!["-O2".to_string()];
        let before = deps(&[("a.cpp", b"main"), ("h1.h", b"one")]);
        let after = deps(&[("a.cpp", b"main"), ("h1.h", b"changed")]);

        let key_before = object_key("g++", &args, &before);
        let key_after = object_key("g++", &args, &after);
        assert_ne!(key_before.digest, key_after.digest);
        assert_ne!(key_before.extra, key_after.extra);
    }
}
