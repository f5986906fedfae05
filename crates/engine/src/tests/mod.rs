mod compaction_tests;
mod helpers;
mod manifest_tests;
