/// Flat path table: hash-indexed full-path -> inode lookup, plus the
/// collision resolver blob used when two paths share a hash bucket.
use std::collections::BTreeMap;

/// Case-folding 31-multiplier path hash used by the mount-time lookup
pub fn path_hash(path: &str) -> u32 {
    let mut hash = 0u32;
    for c in path.chars() {
        hash = (c.to_ascii_uppercase() as u32).wrapping_add(hash.wrapping_mul(31));
    }
    hash
}

/// Bit marking a table value as an offset into the collision resolver
pub const FPT_COLLISION_BIT: u32 = 0x8000_0000;

pub struct FlatPathTable {
    data: Vec<u8>,
    has_collision: bool,
}

pub struct CollisionResolver {
    data: Vec<u8>,
}

impl FlatPathTable {
    /// Build the table (and resolver, when needed) from `(full path, inode)`
    /// pairs. Output is deterministic: buckets ascend by hash, bucket
    /// members ascend by path.
    pub fn build(entries: &[(String, u32)]) -> (FlatPathTable, Option<CollisionResolver>) {
        let mut buckets: BTreeMap<u32, Vec<(String, u32)>> = BTreeMap::new();
        for (path, ino) in entries {
            buckets
                .entry(path_hash(path))
                .or_default()
                .push((path.clone(), *ino));
        }
        let has_collision = buckets.values().any(|v| v.len() > 1);

        let mut table = Vec::with_capacity(buckets.len() * 8);
        let mut resolver = vec![];
        for (hash, mut members) in buckets {
            table.extend_from_slice(&hash.to_le_bytes());
            if members.len() == 1 {
                table.extend_from_slice(&members[0].1.to_le_bytes());
                continue;
            }
            members.sort();
            let offset = resolver.len() as u32;
            table.extend_from_slice(&(FPT_COLLISION_BIT | offset).to_le_bytes());
            for (path, ino) in &members {
                resolver.extend_from_slice(&ino.to_le_bytes());
                resolver.extend_from_slice(&(path.len() as u32).to_le_bytes());
                resolver.extend_from_slice(path.as_bytes());
                while resolver.len() % 4 != 0 {
                    resolver.push(0);
                }
            }
            // bucket terminator
            resolver.extend_from_slice(&u32::MAX.to_le_bytes());
            resolver.extend_from_slice(&0u32.to_le_bytes());
        }

        (
            FlatPathTable {
                data: table,
                has_collision,
            },
            if has_collision {
                Some(CollisionResolver { data: resolver })
            } else {
                None
            },
        )
    }

    pub fn has_collision(&self) -> bool {
        self.has_collision
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Look an inode up the way the runtime would; collided buckets return
    /// the resolver offset with the marker bit set.
    pub fn lookup(&self, path: &str) -> Option<u32> {
        let hash = path_hash(path);
        self.data.chunks_exact(8).find_map(|rec| {
            let h = u32::from_le_bytes(rec[0..4].try_into().unwrap());
            (h == hash).then(|| u32::from_le_bytes(rec[4..8].try_into().unwrap()))
        })
    }
}

impl CollisionResolver {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_case_folding() {
        assert_eq!(path_hash("/EBOOT.BIN"), path_hash("/eboot.bin"));
        assert_ne!(path_hash("/a"), path_hash("/b"));
    }

    // "AQ" and "B2" collide: 65*31+81 == 66*31+50
    #[test]
    fn known_collision_pair() {
        assert_eq!(path_hash("/AQ"), path_hash("/B2"));
    }

    #[test]
    fn no_collision_tuple() {
        let entries = vec![("/a".to_string(), 3), ("/b".to_string(), 4)];
        let (fpt, cr) = FlatPathTable::build(&entries);
        assert!(!fpt.has_collision());
        assert!(cr.is_none());
        assert_eq!(fpt.size(), 16);
        assert_eq!(fpt.lookup("/a"), Some(3));
        assert_eq!(fpt.lookup("/b"), Some(4));
        assert_eq!(fpt.lookup("/c"), None);
    }

    #[test]
    fn collision_goes_through_resolver() {
        let entries = vec![
            ("/AQ".to_string(), 3),
            ("/B2".to_string(), 4),
            ("/ok".to_string(), 5),
        ];
        let (fpt, cr) = FlatPathTable::build(&entries);
        assert!(fpt.has_collision());
        let cr = cr.unwrap();
        assert!(cr.size() > 0);
        let v = fpt.lookup("/AQ").unwrap();
        assert_eq!(v & FPT_COLLISION_BIT, FPT_COLLISION_BIT);
        assert_eq!(fpt.lookup("/ok"), Some(5));
        // both colliding paths resolve inside the blob
        let blob = cr.into_bytes();
        let text = String::from_utf8_lossy(&blob).to_string();
        assert!(text.contains("/AQ"));
        assert!(text.contains("/B2"));
    }
}
