//! Resource names derived from the cluster name, and the known WAN locations.

pub fn resource_group_name(cluster: &str) -> String {
    format!("{}-rg", cluster)
}

pub fn vnet_name(cluster: &str) -> String {
    format!("{}-vnet", cluster)
}

pub fn nsg_name(cluster: &str) -> String {
    format!("{}-nsg", cluster)
}

pub fn subnet_name(cluster: &str) -> String {
    format!("{}-subnet", cluster)
}

pub fn vm_name(cluster: &str, id: usize) -> String {
    format!("{}-{}", cluster, id)
}

pub fn public_ip_name(cluster: &str, id: usize) -> String {
    format!("{}-ip", vm_name(cluster, id))
}

pub fn nic_name(cluster: &str, id: usize) -> String {
    format!("{}-nic", vm_name(cluster, id))
}

pub fn work_disk_name(cluster: &str, id: usize) -> String {
    format!("{}-wdisk", vm_name(cluster, id))
}

/// Name of a WAN instance; paired clusters number the instances of a location.
pub fn wan_instance_name(cluster: &str, location: &str, offset: Option<usize>) -> String {
    match offset {
        Some(offset) => format!("{}-{}-{}", cluster, location, offset),
        None => format!("{}-{}", cluster, location),
    }
}

/// Whether `name` is one of the WAN instance names [`wan_instance_name`] gives
/// `cluster` for a known location, with or without an offset.
pub fn is_wan_instance_of(cluster: &str, name: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(cluster)
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return false;
    };
    KNOWN_LOCATIONS.iter().any(|location| match rest.strip_prefix(location.name) {
        Some("") => true,
        Some(offset) => offset
            .strip_prefix('-')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    })
}

/// RE2 pattern for `gcloud --filter` matching the same names as [`is_wan_instance_of`].
pub fn wan_instance_filter(cluster: &str) -> String {
    let locations: Vec<&str> = KNOWN_LOCATIONS.iter().map(|l| l.name).collect();
    format!(
        "name ~ ^{}-({})(-[0-9]+)?$",
        regex::escape(cluster),
        locations.join("|")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WanLocation {
    pub name: &'static str,
    pub region: &'static str,
    pub zone_letter: &'static str,
}

impl WanLocation {
    pub fn zone(&self) -> String {
        format!("{}-{}", self.region, self.zone_letter)
    }
}

pub const KNOWN_LOCATIONS: [WanLocation; 3] = [
    WanLocation {
        name: "oregon",
        region: "us-west1",
        zone_letter: "b",
    },
    WanLocation {
        name: "iowa",
        region: "us-central1",
        zone_letter: "b",
    },
    WanLocation {
        name: "virginia",
        region: "us-east4",
        zone_letter: "b",
    },
];

pub fn lookup_location(name: &str) -> Option<&'static WanLocation> {
    KNOWN_LOCATIONS.iter().find(|l| l.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(resource_group_name("bench"), "bench-rg");
        assert_eq!(nic_name("bench", 3), "bench-3-nic");
        assert_eq!(work_disk_name("bench", 0), "bench-0-wdisk");
        assert_eq!(wan_instance_name("bench", "iowa", None), "bench-iowa");
        assert_eq!(wan_instance_name("bench", "iowa", Some(2)), "bench-iowa-2");
    }

    #[test]
    fn test_wan_instance_names_of_other_clusters_do_not_match() {
        assert!(is_wan_instance_of("bench", "bench-oregon"));
        assert!(is_wan_instance_of("bench", "bench-iowa-3"));
        assert!(!is_wan_instance_of("bench", &wan_instance_name("bench-prod", "oregon", None)));
        assert!(!is_wan_instance_of("bench", &wan_instance_name("bench-prod", "iowa", Some(1))));
        assert!(!is_wan_instance_of("bench", "bench-oregon-"));
        assert!(!is_wan_instance_of("bench", "bench-oregonx"));
        assert!(!is_wan_instance_of("bench", "benchmark-oregon"));
        assert!(!is_wan_instance_of("bench", "bench-2"));
    }

    #[test]
    fn test_wan_instance_filter_escapes_cluster_name() {
        assert_eq!(
            wan_instance_filter("bench.1"),
            "name ~ ^bench\\.1-(oregon|iowa|virginia)(-[0-9]+)?$"
        );
    }

    #[test]
    fn test_lookup_location() {
        assert_eq!(lookup_location("oregon").unwrap().zone(), "us-west1-b");
        assert_eq!(lookup_location("virginia").unwrap().region, "us-east4");
        assert!(lookup_location("mars").is_none());
    }
}
