//! Dependency graph and wave planning

use std::collections::{HashMap, HashSet};

use app_config::ServiceSpec;

use crate::{Error, Result};

/// Dependency graph over the services of one run
pub struct DependencyGraph {
    /// All node names
    nodes: HashSet<String>,
    /// dependency -> dependents
    dependents: HashMap<String, Vec<String>>,
    /// dependent -> dependencies
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for a set of services
    ///
    /// Edges to services outside the set are ignored: when the user starts a
    /// subset, its external dependencies are assumed satisfied.
    pub fn from_services<'a>(services: impl IntoIterator<Item = &'a ServiceSpec>) -> Self {
        let services: Vec<&ServiceSpec> = services.into_iter().collect();
        let nodes: HashSet<String> = services.iter().map(|s| s.name.clone()).collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

        for service in &services {
            for dep in &service.depends_on {
                if !nodes.contains(dep) {
                    continue;
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(service.name.clone());
                dependencies
                    .entry(service.name.clone())
                    .or_default()
                    .push(dep.clone());
            }
        }

        Self {
            nodes,
            dependents,
            dependencies,
        }
    }

    /// Direct dependencies of a node, restricted to the run's set
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Partition into startup waves (Kahn's algorithm, layered)
    ///
    /// Each wave contains services whose dependencies are all in earlier
    /// waves. A stall before every node is placed means a cycle; the nodes
    /// still carrying unsatisfied dependencies are reported, sorted, as the
    /// offenders.
    pub fn waves(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.as_str(),
                    self.dependencies.get(n).map(Vec::len).unwrap_or(0),
                )
            })
            .collect();

        let mut waves = Vec::new();
        let mut placed = 0usize;

        while placed < self.nodes.len() {
            let mut wave: Vec<String> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(name, _)| name.to_string())
                .collect();

            if wave.is_empty() {
                let mut cycle: Vec<String> = in_degree
                    .iter()
                    .filter(|(_, &deg)| deg > 0)
                    .map(|(name, _)| name.to_string())
                    .collect();
                cycle.sort();
                return Err(Error::DependencyCycle(cycle));
            }

            wave.sort();
            for name in &wave {
                in_degree.remove(name.as_str());
                if let Some(dependents) = self.dependents.get(name) {
                    for dependent in dependents {
                        if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                            *deg -= 1;
                        }
                    }
                }
            }
            placed += wave.len();
            waves.push(wave);
        }

        Ok(waves)
    }

    /// Flat topological order (wave order, then name)
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.waves()?.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_config::ServiceKind;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            project_dir: "/proj".into(),
            kind: ServiceKind::Native,
            language: None,
            framework: None,
            command: vec!["true".to_string()],
            script: None,
            ports: vec![],
            flexible: true,
            env: Default::default(),
            health_check: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            workdir: None,
            restart: Default::default(),
            ready_markers: vec![],
        }
    }

    #[test]
    fn test_waves_respect_dependencies() {
        let services = vec![
            spec("db", &[]),
            spec("cache", &[]),
            spec("api", &["db", "cache"]),
            spec("web", &["api"]),
        ];
        let graph = DependencyGraph::from_services(&services);
        let waves = graph.waves().unwrap();

        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["cache", "db"]);
        assert_eq!(waves[1], vec!["api"]);
        assert_eq!(waves[2], vec!["web"]);
    }

    #[test]
    fn test_cycle_detected_with_names() {
        let services = vec![spec("a", &["b"]), spec("b", &["a"]), spec("c", &[])];
        let graph = DependencyGraph::from_services(&services);

        match graph.waves().unwrap_err() {
            Error::DependencyCycle(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_external_dependencies_ignored() {
        // "api" depends on a service that is not part of this run.
        let services = vec![spec("api", &["db"])];
        let graph = DependencyGraph::from_services(&services);
        let waves = graph.waves().unwrap();
        assert_eq!(waves, vec![vec!["api"]]);
    }

    #[test]
    fn test_topological_order_flattens() {
        let services = vec![spec("db", &[]), spec("api", &["db"])];
        let graph = DependencyGraph::from_services(&services);
        assert_eq!(graph.topological_order().unwrap(), vec!["db", "api"]);
    }
}
