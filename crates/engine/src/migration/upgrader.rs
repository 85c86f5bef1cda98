use crate::document::Document;
use crate::error::MigrationError;

/// Which kind of stored document a transform applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaTag(pub &'static str);

impl SchemaTag {
    pub const CHUNK: Self = Self("chunk");
}

/// A versioned document transform: bring `doc` from schema version `from`
/// to schema version `to`.
///
/// Implementations must be a no-op when `from >= to`.
pub trait SchemaUpgrader: Send + Sync {
    fn upgrade(
        &self,
        schema: SchemaTag,
        doc: Document,
        from: i32,
        to: i32,
    ) -> Result<Document, MigrationError>;
}

/// A single fix: mutate the document in place, or explain why it cannot be fixed.
pub type FixFn = Box<dyn Fn(&mut Document) -> Result<(), String> + Send + Sync>;

struct Fix {
    version: i32,
    schema: SchemaTag,
    name: &'static str,
    apply: FixFn,
}

/// An ordered list of fixes, each introduced at a data version.
///
/// Upgrading from `a` to `b` applies every fix for the schema whose version
/// lies in `a < version <= b`, lowest version first. Fixes that share a
/// version run in registration order.
pub struct StepUpgrader {
    fixes: Vec<Fix>,
}

impl StepUpgrader {
    pub fn builder() -> StepUpgraderBuilder {
        StepUpgraderBuilder { fixes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    /// `(version, name)` of every registered fix, in application order.
    pub fn fixes(&self) -> Vec<(i32, &'static str)> {
        self.fixes.iter().map(|f| (f.version, f.name)).collect()
    }
}

impl SchemaUpgrader for StepUpgrader {
    fn upgrade(
        &self,
        schema: SchemaTag,
        mut doc: Document,
        from: i32,
        to: i32,
    ) -> Result<Document, MigrationError> {
        if from >= to {
            return Ok(doc);
        }
        let applicable = self
            .fixes
            .iter()
            .filter(|f| f.schema == schema && f.version > from && f.version <= to);
        for fix in applicable {
            (fix.apply)(&mut doc).map_err(|reason| MigrationError::Step {
                fix: fix.name,
                version: fix.version,
                reason,
            })?;
        }
        Ok(doc)
    }
}

pub struct StepUpgraderBuilder {
    fixes: Vec<Fix>,
}

impl StepUpgraderBuilder {
    pub fn fix<F>(mut self, version: i32, schema: SchemaTag, name: &'static str, apply: F) -> Self
    where
        F: Fn(&mut Document) -> Result<(), String> + Send + Sync + 'static,
    {
        self.fixes.push(Fix {
            version,
            schema,
            name,
            apply: Box::new(apply),
        });
        self
    }

    pub fn build(mut self) -> StepUpgrader {
        // Stable sort keeps registration order within a version.
        self.fixes.sort_by_key(|f| f.version);
        StepUpgrader { fixes: self.fixes }
    }
}
