//! Aggregate filters: what one shared query must select so that every
//! subscriber of a context can be served from its result.

use std::collections::BTreeSet;

use fleet_status::{OutputMode, StatusQuery, StatusType};

use crate::{NotifyOutput, NotifyType, StatusRegistration};

/// `None` on an axis selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateFilter {
    pub apps: Option<BTreeSet<String>>,
    pub clusters: Option<BTreeSet<String>>,
    pub resources: Option<BTreeSet<String>>,
    pub summary_only: bool,
}

fn axis(v: &[String]) -> Option<BTreeSet<String>> { if v.is_empty() { None } else { Some(v.iter().cloned().collect()) } }

fn union(a: Option<BTreeSet<String>>, b: Option<BTreeSet<String>>) -> Option<BTreeSet<String>> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        _ => None,
    }
}

fn allows(set: &Option<BTreeSet<String>>, name: &str) -> bool { set.as_ref().map_or(true, |s| s.contains(name)) }

fn list(set: &Option<BTreeSet<String>>) -> Vec<String> { set.iter().flatten().cloned().collect() }

impl AggregateFilter {
    /// A single subscriber's own filter.
    pub fn of(reg: &StatusRegistration) -> Self {
        Self {
            apps: axis(&reg.apps),
            clusters: axis(&reg.clusters),
            resources: axis(&reg.resources),
            summary_only: reg.output == NotifyOutput::Summary,
        }
    }

    /// Union of two filters; an unfiltered axis on either side stays unfiltered.
    pub fn merge(self, other: Self) -> Self {
        Self {
            apps: union(self.apps, other.apps),
            clusters: union(self.clusters, other.clusters),
            resources: union(self.resources, other.resources),
            summary_only: self.summary_only && other.summary_only,
        }
    }

    /// `None` when there are no registrations.
    pub fn union_of<'a>(regs: impl IntoIterator<Item = &'a StatusRegistration>) -> Option<Self> {
        regs.into_iter().map(Self::of).reduce(Self::merge)
    }

    pub fn keeps_app(&self, app: &str) -> bool { allows(&self.apps, app) }
    pub fn keeps_cluster(&self, cluster: &str) -> bool { allows(&self.clusters, cluster) }
    pub fn keeps_resource(&self, name: &str) -> bool { allows(&self.resources, name) }

    /// Whether a change to `app` on `cluster` can affect the filtered view.
    pub fn matches(&self, app: &str, cluster: &str) -> bool { self.keeps_app(app) && self.keeps_cluster(cluster) }

    /// The status query covering this filter.
    pub fn query(&self, t: NotifyType) -> StatusQuery {
        let status_type = match t {
            NotifyType::Ready => StatusType::Ready,
            NotifyType::Deployed => StatusType::Deployed,
        };
        let output = if self.summary_only { OutputMode::Summary } else { OutputMode::All };
        StatusQuery { apps: list(&self.apps), clusters: list(&self.clusters), resources: list(&self.resources), ..StatusQuery::new(status_type, output) }
    }
}

/// Aggregate filters of one context, per status type. `None` means no
/// subscriber of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub ready: Option<AggregateFilter>,
    pub deployed: Option<AggregateFilter>,
}

impl Filters {
    pub fn compute<'a, I>(regs: I) -> Self
    where
        I: IntoIterator<Item = &'a StatusRegistration>,
    {
        let regs: Vec<&StatusRegistration> = regs.into_iter().collect();
        let of = |t: NotifyType| AggregateFilter::union_of(regs.iter().copied().filter(|r| r.status_type == t));
        Self { ready: of(NotifyType::Ready), deployed: of(NotifyType::Deployed) }
    }

    pub fn get(&self, t: NotifyType) -> Option<&AggregateFilter> {
        match t {
            NotifyType::Ready => self.ready.as_ref(),
            NotifyType::Deployed => self.deployed.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Scope;

    fn reg(id: &str, t: NotifyType, out: NotifyOutput, apps: &[&str]) -> StatusRegistration {
        let key = Scope::LogicalCloud { project: "p".into(), logical_cloud: "lc".into() };
        StatusRegistration { apps: apps.iter().map(|a| a.to_string()).collect(), ..StatusRegistration::new(id, key, t, out) }
    }

    fn set(v: &[&str]) -> Option<BTreeSet<String>> { Some(v.iter().map(|s| s.to_string()).collect()) }

    #[test]
    fn union_and_collapse() {
        let a = reg("a", NotifyType::Ready, NotifyOutput::Summary, &["A"]);
        let b = reg("b", NotifyType::Ready, NotifyOutput::Summary, &["B"]);
        let f = AggregateFilter::union_of([&a, &b]).unwrap();
        assert_eq!(f.apps, set(&["A", "B"]));
        assert!(f.summary_only);
        assert!(f.matches("A", "p+c") && !f.matches("C", "p+c"));

        let everything = reg("c", NotifyType::Ready, NotifyOutput::All, &[]);
        let f = AggregateFilter::union_of([&a, &b, &everything]).unwrap();
        assert_eq!(f.apps, None);
        assert!(!f.summary_only);
        assert!(f.matches("C", "p+c"));
    }

    #[test]
    fn per_type_and_query() {
        let r = reg("a", NotifyType::Ready, NotifyOutput::Summary, &["A"]);
        let d = StatusRegistration { clusters: vec!["p+east".into()], ..reg("b", NotifyType::Deployed, NotifyOutput::All, &[]) };
        let f = Filters::compute([&r, &d]);
        assert_eq!(f.get(NotifyType::Ready).unwrap().apps, set(&["A"]));
        let q = f.get(NotifyType::Deployed).unwrap().query(NotifyType::Deployed);
        assert_eq!(q.status_type, StatusType::Deployed);
        assert_eq!(q.output, OutputMode::All);
        assert_eq!(q.clusters, vec!["p+east".to_string()]);
        assert!(q.apps.is_empty());
        assert_eq!(Filters::compute([&r]).deployed, None);
        assert_eq!(Filters::compute(std::iter::empty()), Filters::default());
    }
}
