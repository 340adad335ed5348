//! Built-in stressors

mod cpu;
mod nop;
mod port;
mod sched;
mod vm;

use stressrun::{registry::RegistryError, Registry, Stressor};

/// Every built-in stressor, in listing order
static STRESSORS: [&dyn Stressor; 6] = [
    &cpu::Cpu,
    &sched::Getpid,
    &nop::Nop,
    &port::Port,
    &vm::Vm,
    &sched::Yield,
];

/// Registry of the built-in stressors
pub fn registry() -> Result<Registry, RegistryError> {
    Registry::new(&STRESSORS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), STRESSORS.len());
        for stressor in STRESSORS {
            assert!(registry.get(stressor.name()).is_some());
            assert!(!stressor.name().contains(':'));
        }
    }
}
